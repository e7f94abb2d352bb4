use std::ops::Range;

use serde::{Deserialize, Serialize};

/// What separated a piece of prose from the piece before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Boundary {
    Start,
    Line,
    Paragraph,
}

impl Boundary {
    /// The stronger of two boundaries; a blank line anywhere in between wins.
    pub(crate) fn max(self, other: Self) -> Self {
        match (self, other) {
            (Self::Paragraph, _) | (_, Self::Paragraph) => Self::Paragraph,
            (Self::Line, _) | (_, Self::Line) => Self::Line,
            _ => Self::Start,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Piece {
    pub range: Range<usize>,
    pub boundary: Boundary,
}

/// Splits `text[range]` at newlines: a run holding two or more newlines is a
/// paragraph break, a lone newline a line break. Newlines for which `masked`
/// returns true do not split.
pub(crate) fn split_pieces(text: &str, range: Range<usize>, masked: impl Fn(usize) -> bool) -> Vec<Piece> {
    let bytes = text.as_bytes();
    let mut pieces = Vec::new();
    let mut piece_start = range.start;
    let mut boundary = Boundary::Start;
    let mut index = range.start;

    while index < range.end {
        if bytes[index] != b'\n' || masked(index) {
            index += 1;
            continue;
        }

        let run_start = index;
        let mut newlines = 0;
        while index < range.end && matches!(bytes[index], b'\n' | b'\r' | b' ' | b'\t') {
            if bytes[index] == b'\n' {
                newlines += 1;
            }
            index += 1;
        }

        pieces.push(Piece {
            range: piece_start..run_start,
            boundary,
        });
        boundary = if newlines >= 2 {
            Boundary::Paragraph
        } else {
            Boundary::Line
        };
        piece_start = index;
    }

    pieces.push(Piece {
        range: piece_start..range.end,
        boundary,
    });
    pieces
}

/// Splits prose into trimmed, non-empty pieces with the boundary before each.
pub fn split_prose(text: &str) -> Vec<(&str, Boundary)> {
    let mut pending = Boundary::Start;
    let mut output = Vec::new();
    for piece in split_pieces(text, 0..text.len(), |_| false) {
        pending = pending.max(piece.boundary);
        let content = text[piece.range].trim();
        if content.is_empty() {
            continue;
        }
        let boundary = if output.is_empty() { Boundary::Start } else { pending };
        output.push((content, boundary));
        pending = Boundary::Start;
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_split_paragraphs_and_newlines_split_lines() {
        let text = "first line\nsecond line\n\n  \nnext paragraph";
        assert_eq!(
            split_prose(text),
            vec![
                ("first line", Boundary::Start),
                ("second line", Boundary::Line),
                ("next paragraph", Boundary::Paragraph),
            ]
        );
    }

    #[test]
    fn masked_newlines_do_not_split() {
        let text = "a\nb\nc";
        let pieces = split_pieces(text, 0..text.len(), |index| index == 1);
        let ranges = pieces.iter().map(|p| &text[p.range.clone()]).collect::<Vec<_>>();
        assert_eq!(ranges, vec!["a\nb", "c"]);
    }

    #[test]
    fn empty_and_whitespace_only_input_yields_nothing() {
        assert!(split_prose("").is_empty());
        assert!(split_prose(" \n\n \n").is_empty());
    }
}
