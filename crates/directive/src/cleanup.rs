use std::sync::LazyLock;

use regex::Regex;

/// Labels whose `【…】` sections are inner monologue or system chatter.
const HIDDEN_LABEL_KEYWORDS: [&str; 10] = [
    "心声", "思维链", "思考", "系统", "指令", "提示", "缓冲", "内部", "调试", "日志",
];

/// Longest label, in chars, still treated as a section header.
const MAX_LABEL_CHARS: usize = 20;

static STRAY_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\[/?(?:MSG|REPLY)\d+\]",
        r"|\[WAIT(?::[^\]\n]*)?\]",
        r"|\[/?THINK\]|</?think(?:ing)?>",
        r"|\[(?:ACCEPT|REJECT)_LISTEN_INVITATION\]",
        r"|\[(?:INVITE_LISTEN|CHANGE_SONG|ADD_FAVORITE_SONG|VOICE_CALL|VIDEO_CALL)\]",
        r"|【/?(?:表情包|语音条|地理位置|红包|领取红包|退还红包|转账|确认收款|退还转账|撤回|图片描述)】",
    ))
    .expect("stray tag regex")
});

static ROLE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^[ \t]*(?:assistant|ai|bot|助手|回复)[ \t]*[:：][ \t]*")
        .expect("role prefix regex")
});

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json.*?```[ \t]*\n?").expect("fenced json regex")
});

static STRUCTURED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*(?:\{[ \t]*"[^"\n]*"[ \t]*:.*\}|\[[ \t]*\{.*\}[ \t]*\]|```(?:json)?)[ \t]*(?:\n|$)"#,
    )
    .expect("structured line regex")
});

static BRACKETED_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"[\[【(（][ \t]*",
        r"(?:\d{4}[-/.]\d{1,2}[-/.]\d{1,2}(?:[ \tT]+\d{1,2}:\d{2}(?::\d{2})?)?|\d{1,2}:\d{2}(?::\d{2})?)",
        r"[ \t]*[\]】)）][ \t]*",
    ))
    .expect("bracketed timestamp regex")
});

static LEADING_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:\d{4}[-/.]\d{1,2}[-/.]\d{1,2}[ \t]+)?\d{1,2}:\d{2}(?::\d{2})?[ \t]+")
        .expect("leading timestamp regex")
});

static TRAILING_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)[ \t]+$").expect("trailing space regex"));

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("excess newline regex"));

/// Scrubs markup that must never reach a bubble.
///
/// Passes repeat until the text stops changing, so `cleanup(cleanup(x)) == cleanup(x)`.
/// Every pass only deletes text, so the loop ends.
pub fn cleanup(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = cleanup_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn cleanup_pass(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = STRAY_TAGS.replace_all(&text, "");
    let text = strip_hidden_sections(&text);
    let text = FENCED_JSON.replace_all(&text, "");
    let text = STRUCTURED_LINE.replace_all(&text, "");
    let text = ROLE_PREFIX.replace_all(&text, "");
    let text = BRACKETED_TIMESTAMP.replace_all(&text, "");
    let text = LEADING_TIMESTAMP.replace_all(&text, "");
    let text = TRAILING_SPACE.replace_all(&text, "");
    let text = EXCESS_NEWLINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Removes `【label】…` sections whose label names inner monologue. A closed
/// label runs to the next `【` or line end; an unclosed one to line end.
fn strip_hidden_sections(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('【') {
        let open = cursor + offset;
        let label_start = open + '【'.len_utf8();
        let rest = &text[label_start..];

        let label_end = rest
            .char_indices()
            .take(MAX_LABEL_CHARS + 1)
            .find(|(_, c)| *c == '】' || *c == '\n')
            .map(|(index, c)| (index, c == '】'));

        let (label, closed) = match label_end {
            Some((index, closed)) => (&rest[..index], closed),
            None => {
                let window = rest
                    .char_indices()
                    .nth(MAX_LABEL_CHARS)
                    .map_or(rest.len(), |(index, _)| index);
                (&rest[..window], false)
            }
        };

        let hidden = HIDDEN_LABEL_KEYWORDS
            .iter()
            .any(|keyword| label.contains(keyword));
        if !hidden {
            output.push_str(&text[cursor..label_start]);
            cursor = label_start;
            continue;
        }

        output.push_str(&text[cursor..open]);
        let body_start = if closed {
            label_start + label.len() + '】'.len_utf8()
        } else {
            label_start
        };
        let body = &text[body_start..];
        let stop = if closed {
            body.find(['【', '\n'])
        } else {
            body.find('\n')
        };
        cursor = stop.map_or(text.len(), |stop| body_start + stop);
    }

    output.push_str(&text[cursor..]);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_inner_monologue_sections() {
        let text = "刚洗完澡，头发还湿着呢\n\n【心声】其实很开心\n晚点聊";
        assert_eq!(cleanup(text), "刚洗完澡，头发还湿着呢\n\n晚点聊");

        let unclosed = "你确定要看？\n\n【心声...";
        assert_eq!(cleanup(unclosed), "你确定要看？");

        let chained = "ok【系统提示】ignore this\nfine";
        assert_eq!(cleanup(chained), "ok\nfine");
    }

    #[test]
    fn keeps_ordinary_bracketed_labels() {
        let text = "【重要】明天见";
        assert_eq!(cleanup(text), "【重要】明天见");
    }

    #[test]
    fn strips_role_prefixes_timestamps_and_structured_lines() {
        let text = concat!(
            "assistant: hello\n",
            "[21:04] are you there\n",
            "{\"mood\": \"happy\"}\n",
            "```json\n{\"a\": 1}\n```\n",
            "12:30 lunch?",
        );
        assert_eq!(cleanup(text), "hello\nare you there\nlunch?");
    }

    #[test]
    fn removes_stray_vocabulary_tags() {
        let text = "[MSG1]hi[/MSG1] [WAIT:2]there[/MSG7]";
        assert_eq!(cleanup(text), "hi there");
    }

    #[test]
    fn collapses_blank_line_runs() {
        assert_eq!(cleanup("a\n\n\n\n\nb  \n"), "a\n\nb");
    }

    fn nested_tags(depth: usize) -> String {
        format!("{}MSG1]{}x", "[".repeat(depth), "MSG1]".repeat(depth - 1))
    }

    #[test]
    fn deeply_nested_tags_are_removed_completely() {
        assert_eq!(cleanup(&nested_tags(12)), "x");
        assert_eq!(cleanup(&nested_tags(40)), "x");
    }

    #[test]
    fn cleanup_is_idempotent() {
        let deep = nested_tags(12);
        let samples = [
            deep.as_str(),
            "【心声】a【心声】b\n\n\n\nassistant: AI: nested",
            "[[MSG1]MSG1]x",
            "  [12:00]  \n\n\n {\"k\": 1}\n text  ",
            "【思考",
            "plain text",
        ];
        for sample in samples {
            let once = cleanup(sample);
            assert_eq!(cleanup(&once), once, "input {sample:?}");
        }
    }
}
