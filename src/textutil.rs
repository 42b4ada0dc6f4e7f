use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, EngineResult};

// ECMAScript whitespace: includes U+FEFF, excludes U+0085 (unlike Unicode `\s`).
const WS: &str = r"[\t\n\x0B\x0C\r \x{00A0}\x{1680}\x{2000}-\x{200A}\x{2028}\x{2029}\x{202F}\x{205F}\x{3000}\x{FEFF}]";

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?s)^({WS}*)(.*?)({WS}*)$")).expect("whitespace regex")
});

// A left double quotation mark right after full-width sentence-final punctuation gets glued to the
// preceding sentence by the segmenter unless a space separates them.
static FULL_WIDTH_QUOTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("([。！？])\u{201C}").expect("full-width quote regex"));

const SOFT_HYPHEN: char = '\u{00AD}';

/// Source text split into its surrounding whitespace and the cleaned body that gets translated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedText {
    pub leading: String,
    pub body: String,
    pub trailing: String,
}

impl NormalizedText {
    /// Wraps a translated body back into the original surrounding whitespace.
    pub fn rewrap(&self, translated_body: &str) -> String {
        denormalize(&self.leading, translated_body, &self.trailing)
    }
}

pub fn normalize(text: &str) -> EngineResult<NormalizedText> {
    let caps = WHITESPACE_RE.captures(text).ok_or_else(|| {
        EngineError::Normalization("failed to match whitespace in the source text".to_string())
    })?;
    let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or("");

    let body = group(2).replace(SOFT_HYPHEN, "");
    let body = FULL_WIDTH_QUOTE_RE
        .replace_all(&body, "${1} \u{201C}")
        .into_owned();

    Ok(NormalizedText {
        leading: group(1).to_string(),
        body,
        trailing: group(3).to_string(),
    })
}

/// The body is inserted as-is; it is never trimmed again.
pub fn denormalize(leading: &str, translated_body: &str, trailing: &str) -> String {
    let mut out = String::with_capacity(leading.len() + translated_body.len() + trailing.len());
    out.push_str(leading);
    out.push_str(translated_body);
    out.push_str(trailing);
    out
}

#[cfg(test)]
mod tests {
    use super::{denormalize, normalize};

    #[test]
    fn splits_surrounding_whitespace() {
        let n = normalize("  \n\tHola mundo.\n\n").expect("normalize");
        assert_eq!(n.leading, "  \n\t");
        assert_eq!(n.body, "Hola mundo.");
        assert_eq!(n.trailing, "\n\n");
    }

    #[test]
    fn inner_line_breaks_stay_in_body() {
        let n = normalize(" first\n\nsecond ").expect("normalize");
        assert_eq!(n.leading, " ");
        assert_eq!(n.body, "first\n\nsecond");
        assert_eq!(n.trailing, " ");
    }

    #[test]
    fn whitespace_round_trips_without_translation() {
        let samples = [
            "",
            " ",
            "\n\t \u{3000}",
            "plain",
            "  padded  ",
            "\r\nmulti\nline\r\n",
            "\u{00A0}nbsp\u{00A0}",
            "\u{FEFF}Hola\u{FEFF}",
            "\u{0085}Hola\u{0085}",
            "蓝色的<b>狗</b>。\n",
        ];
        for s in samples {
            let n = normalize(s).expect("normalize");
            assert_eq!(denormalize(&n.leading, &n.body, &n.trailing), s, "sample {s:?}");
        }
    }

    #[test]
    fn all_whitespace_lands_in_leading() {
        let n = normalize(" \n ").expect("normalize");
        assert_eq!(n.leading, " \n ");
        assert!(n.body.is_empty());
        assert!(n.trailing.is_empty());

        let n = normalize("\u{FEFF}").expect("normalize");
        assert_eq!(n.leading, "\u{FEFF}");
        assert!(n.body.is_empty());
    }

    #[test]
    fn byte_order_mark_is_whitespace_but_next_line_is_not() {
        let n = normalize("\u{FEFF}Hola\u{FEFF}").expect("normalize");
        assert_eq!(n.leading, "\u{FEFF}");
        assert_eq!(n.body, "Hola");
        assert_eq!(n.trailing, "\u{FEFF}");

        let n = normalize("\u{0085}Hola").expect("normalize");
        assert_eq!(n.leading, "");
        assert_eq!(n.body, "\u{0085}Hola");
    }

    #[test]
    fn removes_soft_hyphens() {
        let n = normalize("\u{00AD}trans\u{00AD}la\u{00AD}tion\u{00AD}").expect("normalize");
        assert_eq!(n.body, "translation");
        assert!(!n.body.contains('\u{00AD}'));
    }

    #[test]
    fn separates_quote_after_full_width_punctuation() {
        for (src, want) in [
            ("我走近魔法门。“我不会给你开门的。”", "我走近魔法门。 “我不会给你开门的。”"),
            ("魔法门！“开门”", "魔法门！ “开门”"),
            ("魔法门吗？“不”", "魔法门吗？ “不”"),
        ] {
            assert_eq!(normalize(src).expect("normalize").body, want);
        }
    }

    #[test]
    fn leaves_other_quotes_alone() {
        let n = normalize("He said. “Hi.” 你好，“朋友”").expect("normalize");
        assert_eq!(n.body, "He said. “Hi.” 你好，“朋友”");
    }

    #[test]
    fn rewrap_does_not_trim_translation() {
        let n = normalize("\n Hola \n").expect("normalize");
        assert_eq!(n.rewrap(" Hello "), "\n  Hello  \n");
    }
}
