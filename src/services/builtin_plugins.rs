// 内置插件：数学计算、时间查询与简单 HTTP 读取。
use crate::services::plugins::{FunctionSpec, Plugin};
use crate::services::tool_results::ToolResult;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

const HTTP_BODY_MAX_CHARS: usize = 4000;

fn number_arg(arguments: &Value, key: &str) -> Result<f64> {
    match arguments.get(key) {
        Some(Value::Number(num)) => num.as_f64().ok_or_else(|| anyhow!("参数 {key} 不是数字")),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| anyhow!("参数 {key} 不是数字")),
        _ => Err(anyhow!("缺少参数: {key}")),
    }
}

fn binary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "a": { "type": "number" },
            "b": { "type": "number" }
        },
        "required": ["a", "b"]
    })
}

fn spec(name: &str, description: &str, parameters: Value) -> FunctionSpec {
    FunctionSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn number_result(value: f64) -> Result<ToolResult> {
    if !value.is_finite() {
        bail!("计算结果超出范围");
    }
    Ok(ToolResult::Primitive(json!(value)))
}

pub struct MathPlugin;

#[async_trait]
impl Plugin for MathPlugin {
    fn name(&self) -> &str {
        "math"
    }

    fn description(&self) -> &str {
        "Basic arithmetic"
    }

    fn functions(&self) -> Vec<FunctionSpec> {
        vec![
            spec("add", "Add two numbers", binary_schema()),
            spec("subtract", "Subtract b from a", binary_schema()),
            spec("multiply", "Multiply two numbers", binary_schema()),
            spec("divide", "Divide a by b", binary_schema()),
            spec(
                "power",
                "Raise base to exponent",
                json!({
                    "type": "object",
                    "properties": {
                        "base": { "type": "number" },
                        "exponent": { "type": "number" }
                    },
                    "required": ["base", "exponent"]
                }),
            ),
            spec(
                "sqrt",
                "Square root of x",
                json!({
                    "type": "object",
                    "properties": { "x": { "type": "number" } },
                    "required": ["x"]
                }),
            ),
        ]
    }

    async fn invoke(&self, function: &str, arguments: &Value) -> Result<ToolResult> {
        match function {
            "add" => number_result(number_arg(arguments, "a")? + number_arg(arguments, "b")?),
            "subtract" => number_result(number_arg(arguments, "a")? - number_arg(arguments, "b")?),
            "multiply" => number_result(number_arg(arguments, "a")? * number_arg(arguments, "b")?),
            "divide" => {
                let divisor = number_arg(arguments, "b")?;
                if divisor == 0.0 {
                    bail!("除数不能为 0");
                }
                number_result(number_arg(arguments, "a")? / divisor)
            }
            "power" => number_result(
                number_arg(arguments, "base")?.powf(number_arg(arguments, "exponent")?),
            ),
            "sqrt" => {
                let x = number_arg(arguments, "x")?;
                if x < 0.0 {
                    bail!("负数不能开平方");
                }
                number_result(x.sqrt())
            }
            other => Err(anyhow!("math 插件不支持: {other}")),
        }
    }
}

pub struct TimePlugin;

#[async_trait]
impl Plugin for TimePlugin {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Current date and time"
    }

    fn functions(&self) -> Vec<FunctionSpec> {
        let empty = json!({ "type": "object", "properties": {} });
        vec![
            spec("now", "Current UTC time in RFC 3339", empty.clone()),
            spec("today", "Current UTC date", empty),
            spec(
                "format_timestamp",
                "Format a unix timestamp (seconds)",
                json!({
                    "type": "object",
                    "properties": {
                        "timestamp": { "type": "number" },
                        "format": { "type": "string" }
                    },
                    "required": ["timestamp"]
                }),
            ),
        ]
    }

    async fn invoke(&self, function: &str, arguments: &Value) -> Result<ToolResult> {
        match function {
            "now" => Ok(ToolResult::Text(Utc::now().to_rfc3339())),
            "today" => Ok(ToolResult::Text(Utc::now().format("%Y-%m-%d").to_string())),
            "format_timestamp" => {
                let timestamp = number_arg(arguments, "timestamp")?;
                let format = arguments
                    .get("format")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or("%Y-%m-%d %H:%M:%S");
                let millis = (timestamp * 1000.0).round() as i64;
                let time = DateTime::<Utc>::from_timestamp_millis(millis)
                    .ok_or_else(|| anyhow!("时间戳超出范围"))?;
                Ok(ToolResult::Text(time.format(format).to_string()))
            }
            other => Err(anyhow!("time 插件不支持: {other}")),
        }
    }
}

pub struct HttpPlugin {
    client: reqwest::Client,
}

impl HttpPlugin {
    pub fn new(timeout_s: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s.max(1)))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Plugin for HttpPlugin {
    fn name(&self) -> &str {
        "http"
    }

    fn description(&self) -> &str {
        "Fetch a web resource"
    }

    fn functions(&self) -> Vec<FunctionSpec> {
        vec![spec(
            "get",
            "HTTP GET a URL and return status and body",
            json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
        )]
    }

    async fn invoke(&self, function: &str, arguments: &Value) -> Result<ToolResult> {
        if function != "get" {
            return Err(anyhow!("http 插件不支持: {function}"));
        }
        let raw = arguments
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("缺少参数: url"))?;
        let url = url::Url::parse(raw.trim())?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("仅支持 http/https: {}", url.scheme());
        }
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        let body = truncate_chars(&body, HTTP_BODY_MAX_CHARS);
        Ok(ToolResult::Structured(vec![
            ("status".to_string(), ToolResult::Primitive(json!(status))),
            ("body".to_string(), ToolResult::Text(body)),
        ]))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut output = text.chars().take(max).collect::<String>();
    output.push_str("...");
    output
}
