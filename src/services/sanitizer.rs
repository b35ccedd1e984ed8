// 内容净化：部分模型服务会把带符号的数字（如 "-100"）判定为可疑指令，提交前改写为文字形式。
use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

pub trait ContentSanitizer: Send + Sync {
    fn name(&self) -> &str;

    fn sanitize<'a>(&self, text: &'a str) -> Cow<'a, str>;
}

fn negative_number_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-(\d+)").ok()).as_ref()
}

/// `-100` 改写为 `minus 100`，其余文本保持不变。
pub struct NegativeNumberSanitizer {
    replacement: String,
}

impl NegativeNumberSanitizer {
    pub fn new() -> Self {
        Self::with_word("minus")
    }

    pub fn with_word(word: &str) -> Self {
        Self {
            replacement: format!("{} ${{1}}", word.trim()),
        }
    }
}

impl Default for NegativeNumberSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentSanitizer for NegativeNumberSanitizer {
    fn name(&self) -> &str {
        "negative_number"
    }

    fn sanitize<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match negative_number_regex() {
            Some(regex) => regex.replace_all(text, self.replacement.as_str()),
            None => Cow::Borrowed(text),
        }
    }
}
