// Copyright 2025 Muvon Un Limited
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Line-based rule engine bundled as the default analysis backend

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use super::{text_result, AnalysisEngine};
use crate::config::AnalysisConfig;
use crate::mcp::types::{JsonRpcError, McpTool, INVALID_PARAMS, METHOD_NOT_FOUND};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Info,
	Minor,
	Major,
	Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleInfo {
	pub key: &'static str,
	pub severity: Severity,
	pub description: &'static str,
}

pub const RULES: &[RuleInfo] = &[
	RuleInfo {
		key: "trailing-whitespace",
		severity: Severity::Info,
		description: "Line ends with spaces or tabs",
	},
	RuleInfo {
		key: "line-too-long",
		severity: Severity::Minor,
		description: "Line exceeds the configured maximum length",
	},
	RuleInfo {
		key: "todo-comment",
		severity: Severity::Info,
		description: "TODO, FIXME or XXX marker left in code",
	},
	RuleInfo {
		key: "hardcoded-secret",
		severity: Severity::Critical,
		description: "Credential-like value assigned from a string literal",
	},
	RuleInfo {
		key: "mixed-indentation",
		severity: Severity::Minor,
		description: "Indentation mixes tabs and spaces",
	},
	RuleInfo {
		key: "debug-print",
		severity: Severity::Major,
		description: "Debug output statement left in code",
	},
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
	pub rule: &'static str,
	pub severity: Severity,
	pub line: usize,
	pub message: String,
}

pub struct RuleEngine {
	max_line_length: usize,
	todo: Regex,
	secret: Regex,
	debug_print: Vec<(&'static str, Regex)>,
}

impl RuleEngine {
	pub fn new(config: &AnalysisConfig) -> Result<Self, regex::Error> {
		let debug_print = vec![
			("python", Regex::new(r"^\s*print\s*\(")?),
			("javascript", Regex::new(r"\bconsole\.(log|debug)\s*\(")?),
			("typescript", Regex::new(r"\bconsole\.(log|debug)\s*\(")?),
			("rust", Regex::new(r"\b(println|eprintln|dbg)!\s*\(")?),
			("java", Regex::new(r"\bSystem\.(out|err)\.print(ln)?\s*\(")?),
			("kotlin", Regex::new(r"^\s*println\s*\(")?),
			("go", Regex::new(r"\bfmt\.Print(ln|f)?\s*\(")?),
		];

		Ok(Self {
			max_line_length: config.max_line_length,
			todo: Regex::new(r"\b(TODO|FIXME|XXX)\b")?,
			secret: Regex::new(
				r#"(?i)\b(password|passwd|secret|api[_-]?key|access[_-]?token|token)\b\s*[:=]\s*["'][^"']{4,}["']"#,
			)?,
			debug_print,
		})
	}

	/// Run every rule over `code`. Lines are 1-based.
	pub fn analyze(&self, code: &str, language: Option<&str>) -> Vec<Issue> {
		let language = language.map(normalize_language);
		let debug_print = language.and_then(|lang| {
			self.debug_print
				.iter()
				.find(|(name, _)| *name == lang)
				.map(|(_, re)| re)
		});

		let mut issues = Vec::new();
		for (index, line) in code.lines().enumerate() {
			let number = index + 1;

			if line.ends_with(' ') || line.ends_with('\t') {
				issues.push(issue("trailing-whitespace", number, "Remove trailing whitespace"));
			}

			let length = line.chars().count();
			if length > self.max_line_length {
				issues.push(issue(
					"line-too-long",
					number,
					format!("Line is {} characters, limit is {}", length, self.max_line_length),
				));
			}

			if let Some(found) = self.todo.find(line) {
				issues.push(issue(
					"todo-comment",
					number,
					format!("Resolve the {} marker", found.as_str()),
				));
			}

			if self.secret.is_match(line) {
				issues.push(issue(
					"hardcoded-secret",
					number,
					"Move this credential out of source code",
				));
			}

			let indent: String = line.chars().take_while(|c| *c == ' ' || *c == '\t').collect();
			if indent.contains(' ') && indent.contains('\t') {
				issues.push(issue(
					"mixed-indentation",
					number,
					"Indent with either tabs or spaces",
				));
			}

			if let Some(re) = debug_print {
				if re.is_match(line) {
					issues.push(issue("debug-print", number, "Remove debug output"));
				}
			}
		}
		issues
	}

	fn analyze_tool(&self, arguments: &Value) -> Result<Value, JsonRpcError> {
		let code = arguments
			.get("codeSnippet")
			.and_then(Value::as_str)
			.ok_or_else(|| {
				JsonRpcError::new(INVALID_PARAMS, "Missing required parameter: codeSnippet")
			})?;
		if code.trim().is_empty() {
			return Err(JsonRpcError::new(
				INVALID_PARAMS,
				"Parameter 'codeSnippet' must not be empty",
			));
		}
		let language = arguments.get("language").and_then(Value::as_str);

		let issues = self.analyze(code, language);
		let report = json!({
			"language": language.map(normalize_language),
			"lineCount": code.lines().count(),
			"issueCount": issues.len(),
			"issues": issues,
		});
		let text = serde_json::to_string_pretty(&report)
			.map_err(|e| JsonRpcError::new(crate::mcp::types::INTERNAL_ERROR, e.to_string()))?;
		Ok(text_result(text, false))
	}
}

fn issue(rule: &'static str, line: usize, message: impl Into<String>) -> Issue {
	let severity = RULES
		.iter()
		.find(|r| r.key == rule)
		.map(|r| r.severity)
		.unwrap_or(Severity::Info);
	Issue {
		rule,
		severity,
		line,
		message: message.into(),
	}
}

fn normalize_language(language: &str) -> &str {
	match language.trim() {
		l if l.eq_ignore_ascii_case("py") || l.eq_ignore_ascii_case("python") => "python",
		l if l.eq_ignore_ascii_case("js") || l.eq_ignore_ascii_case("javascript") => "javascript",
		l if l.eq_ignore_ascii_case("ts") || l.eq_ignore_ascii_case("typescript") => "typescript",
		l if l.eq_ignore_ascii_case("rs") || l.eq_ignore_ascii_case("rust") => "rust",
		l if l.eq_ignore_ascii_case("java") => "java",
		l if l.eq_ignore_ascii_case("kt") || l.eq_ignore_ascii_case("kotlin") => "kotlin",
		l if l.eq_ignore_ascii_case("go") || l.eq_ignore_ascii_case("golang") => "go",
		other => other,
	}
}

#[async_trait]
impl AnalysisEngine for RuleEngine {
	fn name(&self) -> &str {
		"rule-engine"
	}

	fn tools(&self) -> Vec<McpTool> {
		vec![
			McpTool::new(
				"analyze_code_snippet",
				"Analyze a code snippet and report issues such as leftover debug output, hardcoded credentials, TODO markers and formatting problems. Returns a JSON report with one entry per issue.",
				json!({
					"type": "object",
					"properties": {
						"codeSnippet": {
							"type": "string",
							"description": "Source code to analyze"
						},
						"language": {
							"type": "string",
							"description": "Language of the snippet, e.g. python, java, rust. Enables language-specific rules."
						}
					},
					"required": ["codeSnippet"],
					"additionalProperties": false
				}),
			)
			.read_only(),
			McpTool::new(
				"list_analysis_rules",
				"List the rules applied by analyze_code_snippet with their severity.",
				json!({
					"type": "object",
					"properties": {},
					"additionalProperties": false
				}),
			)
			.read_only(),
		]
	}

	async fn call(&self, tool: &str, arguments: Value) -> Result<Value, JsonRpcError> {
		match tool {
			"analyze_code_snippet" => self.analyze_tool(&arguments),
			"list_analysis_rules" => {
				let text = serde_json::to_string_pretty(RULES).map_err(|e| {
					JsonRpcError::new(crate::mcp::types::INTERNAL_ERROR, e.to_string())
				})?;
				Ok(text_result(text, false))
			}
			other => Err(JsonRpcError::new(
				METHOD_NOT_FOUND,
				format!("Unknown analysis tool: {}", other),
			)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn engine() -> RuleEngine {
		RuleEngine::new(&AnalysisConfig {
			enabled: true,
			max_line_length: 40,
		})
		.unwrap()
	}

	fn rules_hit(issues: &[Issue]) -> Vec<&'static str> {
		issues.iter().map(|i| i.rule).collect()
	}

	#[test]
	fn test_python_snippet() {
		let code = "def login(user):\n    password = \"hunter22\"\n    print(user)  \n    # TODO: hash it\n";
		let issues = engine().analyze(code, Some("py"));
		let hits = rules_hit(&issues);
		assert!(hits.contains(&"hardcoded-secret"));
		assert!(hits.contains(&"debug-print"));
		assert!(hits.contains(&"trailing-whitespace"));
		assert!(hits.contains(&"todo-comment"));

		let secret = issues.iter().find(|i| i.rule == "hardcoded-secret").unwrap();
		assert_eq!(secret.line, 2);
		assert_eq!(secret.severity, Severity::Critical);
	}

	#[test]
	fn test_debug_print_needs_language() {
		let code = "console.log(x);";
		assert!(engine().analyze(code, None).is_empty());
		assert_eq!(rules_hit(&engine().analyze(code, Some("JS"))), ["debug-print"]);
	}

	#[test]
	fn test_long_line_and_mixed_indent() {
		let code = format!("\t  let x = 1;\n{}", "y".repeat(41));
		let issues = engine().analyze(&code, Some("rust"));
		assert_eq!(rules_hit(&issues), ["mixed-indentation", "line-too-long"]);
		assert_eq!(issues[1].line, 2);
	}

	#[tokio::test]
	async fn test_tool_call_shapes() {
		let engine = engine();
		let result = engine
			.call(
				"analyze_code_snippet",
				json!({"codeSnippet": "int x = 1;", "language": "java"}),
			)
			.await
			.unwrap();
		assert_eq!(result["isError"], false);
		let report: Value =
			serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
		assert_eq!(report["issueCount"], 0);
		assert_eq!(report["language"], "java");

		let err = engine
			.call("analyze_code_snippet", json!({"codeSnippet": "  "}))
			.await
			.unwrap_err();
		assert_eq!(err.code, INVALID_PARAMS);

		let rules = engine.call("list_analysis_rules", json!({})).await.unwrap();
		assert!(rules["content"][0]["text"]
			.as_str()
			.unwrap()
			.contains("hardcoded-secret"));
	}
}
