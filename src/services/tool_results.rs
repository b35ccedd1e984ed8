// 工具结果归一化：在插件/提供方边界把各种返回形态收敛为有限的几种变体。
use serde_json::{Map, Value};

/// 工具调用结果的封闭变体集合，编排层只按标签分支。
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Text(String),
    /// 数字、布尔、空值等 JSON 原始值。
    Primitive(Value),
    Structured(Vec<(String, ToolResult)>),
    List(Vec<ToolResult>),
    /// 无法直接序列化的对象，仅保留类型名与可选的展示文本。
    Opaque {
        type_name: String,
        display: Option<String>,
    },
}

const WRAPPER_KEYS: [&str; 4] = ["text", "content", "value", "result"];

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResult::Text(text.into())
    }

    pub fn opaque(type_name: impl Into<String>, display: Option<String>) -> Self {
        ToolResult::Opaque {
            type_name: type_name.into(),
            display,
        }
    }

    /// 从任意 JSON 适配：文本包装 `{"type":"text","text":..}` 与单键包装会被拆开。
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => ToolResult::Text(text),
            Value::Array(items) => {
                ToolResult::List(items.into_iter().map(ToolResult::from_value).collect())
            }
            Value::Object(map) => Self::from_object(map),
            primitive => ToolResult::Primitive(primitive),
        }
    }

    fn from_object(mut map: Map<String, Value>) -> Self {
        let is_text_block = map.get("type").and_then(Value::as_str) == Some("text")
            && map.get("text").is_some_and(Value::is_string);
        if is_text_block {
            if let Some(Value::String(text)) = map.remove("text") {
                return ToolResult::Text(text);
            }
        }
        if map.len() == 1 {
            let key = map.keys().next().cloned().unwrap_or_default();
            if WRAPPER_KEYS.contains(&key.as_str()) {
                if let Some(inner) = map.remove(&key) {
                    return ToolResult::from_value(inner);
                }
            }
        }
        ToolResult::Structured(
            map.into_iter()
                .map(|(key, value)| (key, ToolResult::from_value(value)))
                .collect(),
        )
    }

    /// 用于日志与标题生成的纯文本视图。
    pub fn as_display_text(&self) -> String {
        match self {
            ToolResult::Text(text) => text.clone(),
            other => serialize_function_result(other).to_string(),
        }
    }
}

impl From<Value> for ToolResult {
    fn from(value: Value) -> Self {
        ToolResult::from_value(value)
    }
}

impl From<String> for ToolResult {
    fn from(value: String) -> Self {
        ToolResult::Text(value)
    }
}

/// 递归输出 JSON 兼容结构，任何输入都不会失败。
pub fn serialize_function_result(result: &ToolResult) -> Value {
    match result {
        ToolResult::Text(text) => Value::String(text.clone()),
        ToolResult::Primitive(value) => value.clone(),
        ToolResult::List(items) => {
            Value::Array(items.iter().map(serialize_function_result).collect())
        }
        ToolResult::Structured(fields) => {
            let mut map = Map::with_capacity(fields.len());
            for (key, value) in fields {
                map.insert(key.clone(), serialize_function_result(value));
            }
            Value::Object(map)
        }
        ToolResult::Opaque { type_name, display } => match display {
            Some(text) => Value::String(text.clone()),
            None => Value::String(format!("<Unserializable {type_name}>")),
        },
    }
}
