use anyhow::{anyhow, Error};
use std::str::FromStr;

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

/// How a single user message is laid out before it reaches the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// `<|im_start|>user ... <|im_end|>` followed by an open assistant turn.
    ChatMl,
    /// DialoGPT convention: the message directly followed by the EOS token.
    EosSuffix,
    Raw,
}

impl PromptStyle {
    pub fn render(&self, message: &str, eos_token: Option<&str>) -> String {
        match self {
            PromptStyle::ChatMl => {
                format!("{IM_START}user\n{message}{IM_END}\n{IM_START}assistant\n")
            }
            PromptStyle::EosSuffix => format!("{message}{}", eos_token.unwrap_or_default()),
            PromptStyle::Raw => message.to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PromptStyle::ChatMl => "chatml",
            PromptStyle::EosSuffix => "eos-suffix",
            PromptStyle::Raw => "raw",
        }
    }
}

impl FromStr for PromptStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "chatml" => Ok(PromptStyle::ChatMl),
            "eos-suffix" | "eos" | "dialogpt" => Ok(PromptStyle::EosSuffix),
            "raw" | "none" => Ok(PromptStyle::Raw),
            other => Err(anyhow!(
                "unknown prompt style '{other}' (expected chatml, eos-suffix or raw)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatml_opens_assistant_turn() {
        let prompt = PromptStyle::ChatMl.render("hi there", None);
        assert_eq!(
            prompt,
            "<|im_start|>user\nhi there<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn eos_suffix_appends_token() {
        assert_eq!(
            PromptStyle::EosSuffix.render("hello", Some("<|endoftext|>")),
            "hello<|endoftext|>"
        );
        assert_eq!(PromptStyle::EosSuffix.render("hello", None), "hello");
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("DialoGPT".parse::<PromptStyle>().unwrap(), PromptStyle::EosSuffix);
        assert_eq!("eos_suffix".parse::<PromptStyle>().unwrap(), PromptStyle::EosSuffix);
        assert_eq!(" ChatML ".parse::<PromptStyle>().unwrap(), PromptStyle::ChatMl);
        assert!("jinja".parse::<PromptStyle>().is_err());
    }
}
