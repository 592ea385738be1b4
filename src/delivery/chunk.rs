//! Splitting of long messages into channel-sized parts

/// Longest message the chat channel accepts, in characters
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Room left in every split part for the part header
const PART_HEADER_RESERVE: usize = 32;

/// Header prepended to every part after the first
pub fn part_header(index: usize, total: usize) -> String {
    format!("📄 Part {}/{}\n\n", index, total)
}

/// Split `text` into parts of at most `limit` characters.
///
/// Each cut is made on the last line break at or before the limit, falling
/// back to a hard cut when the window holds no line break. Line breaks at the
/// start of the following part are dropped. Always returns at least one part.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut parts = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        let cut = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());

        let split_at = match rest[..cut].rfind('\n') {
            Some(pos) if pos > 0 => pos,
            _ => cut,
        };

        parts.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches(|c| c == '\n' || c == '\r');
    }

    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

/// Parts ready to hand to the transport, headers included
pub fn chunk_for_delivery(text: &str) -> Vec<String> {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return vec![text.to_string()];
    }

    let parts = split_message(text, MAX_MESSAGE_LENGTH - PART_HEADER_RESERVE);
    let total = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| {
            if i == 0 {
                part
            } else {
                format!("{}{}", part_header(i + 1, total), part)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_is_single_part() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
        assert_eq!(split_message("", 10), vec![""]);
        assert_eq!(chunk_for_delivery("hello"), vec!["hello"]);
    }

    #[test]
    fn test_split_on_last_line_break() {
        let text = "aaaa\nbbbb\ncccc";
        let parts = split_message(text, 10);
        assert_eq!(parts, vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn test_hard_cut_without_line_break() {
        let parts = split_message("abcdefghij", 4);
        assert_eq!(parts, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_split_counts_characters_not_bytes() {
        let text = "ж".repeat(9);
        let parts = split_message(&text, 4);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.chars().count() <= 4));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_no_part_exceeds_limit() {
        let line = "x".repeat(70);
        let text = vec![line; 200].join("\n");
        for part in split_message(&text, 1000) {
            assert!(part.chars().count() <= 1000);
        }
    }

    #[test]
    fn test_5000_chars_yield_headed_parts() {
        let text = "y".repeat(5000);
        let parts = chunk_for_delivery(&text);
        assert!(parts.len() >= 2);
        assert!(!parts[0].starts_with("📄 Part"));
        for (i, part) in parts.iter().enumerate().skip(1) {
            assert!(part.starts_with(&part_header(i + 1, parts.len())));
        }
        for part in &parts {
            assert!(part.chars().count() <= MAX_MESSAGE_LENGTH);
        }
    }
}
