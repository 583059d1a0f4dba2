//! Matching and light parsing of free-form monitor responses.
//!
//! Responses are plain text. Callers only ever ask "has this arrived yet?" through
//! [`ResponseMatcher`], so the substring rules here can later be swapped for a structured
//! parser without touching the channel.

/// Prompt printed by the monitor after every command.
pub const MONITOR_PROMPT: &str = "(qemu)";

pub trait ResponseMatcher {
    /// Offset one past the end of the match, if `received` holds a complete response.
    /// Anything after it belongs to the next exchange.
    fn match_end(&self, received: &[u8]) -> Option<usize>;

    fn is_complete(&self, received: &[u8]) -> bool {
        self.match_end(received).is_some()
    }
}

impl ResponseMatcher for str {
    fn match_end(&self, received: &[u8]) -> Option<usize> {
        find_subslice(received, self.as_bytes()).map(|at| at + self.len())
    }
}

impl ResponseMatcher for String {
    fn match_end(&self, received: &[u8]) -> Option<usize> {
        self.as_str().match_end(received)
    }
}

/// Matches once the prompt shows up after the echo of `command`, so a prompt left over
/// from an earlier exchange is not mistaken for the reply.
#[derive(Debug, Clone, Copy)]
pub struct PromptAfterEcho<'a> {
    pub command: &'a str,
}

impl ResponseMatcher for PromptAfterEcho<'_> {
    fn match_end(&self, received: &[u8]) -> Option<usize> {
        reply_span(received, self.command).map(|(_, end)| end + MONITOR_PROMPT.len())
    }
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn reply_span(received: &[u8], command: &str) -> Option<(usize, usize)> {
    let echo = find_subslice(received, command.as_bytes())?;
    let start = echo + command.len();
    let prompt = find_subslice(&received[start..], MONITOR_PROMPT.as_bytes())?;
    Some((start, start + prompt))
}

/// Text between the echoed command and the next prompt, trimmed.
pub fn extract_reply(received: &[u8], command: &str) -> Option<String> {
    let (start, end) = reply_span(received, command)?;
    Some(String::from_utf8_lossy(&received[start..end]).trim().to_string())
}

/// Parses the first `address: value` line of a memory dump, e.g.
/// `0000000000000025: 0x00000020`.
pub fn parse_word(response: &str) -> Option<u32> {
    response.lines().find_map(|line| {
        let (_, rest) = line.split_once(": ")?;
        let token = rest.split_whitespace().next()?;
        let digits = token.strip_prefix("0x").unwrap_or(token);
        u32::from_str_radix(digits, 16).ok()
    })
}

/// Fills `{address}` and `{value}` placeholders in a command template.
pub fn render_command(template: &str, address: u32, value: Option<u32>) -> String {
    let mut command = template.replace("{address}", &format!("0x{:08x}", address));
    if let Some(value) = value {
        command = command.replace("{value}", &format!("0x{:08x}", value));
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match() {
        assert!("ready".is_complete(b"booting...\nready\n".as_slice()));
        assert!(!"ready".is_complete(b"read".as_slice()));
        assert!("".is_complete(b"".as_slice()));
    }

    #[test]
    fn test_prompt_must_follow_echo() {
        let matcher = PromptAfterEcho { command: "info registers" };
        assert!(!matcher.is_complete(b"(qemu) info registers\nR00=00000000".as_slice()));
        assert!(matcher.is_complete(b"(qemu) info registers\nR00=00000000\n(qemu) ".as_slice()));
    }

    #[test]
    fn test_match_end_stops_at_match() {
        assert_eq!("ready".match_end(b"ready\r\nnext".as_slice()), Some(5));
        let matcher = PromptAfterEcho { command: "info status" };
        let received = b"info status\r\nVM status: running\r\n(qemu) info";
        assert_eq!(matcher.match_end(received.as_slice()), Some(received.len() - 5));
    }

    #[test]
    fn test_extract_reply() {
        let received = b"QEMU monitor\n(qemu) xp /1wx 0x00000025\n0000000000000025: 0x00000020\n(qemu) ";
        let reply = extract_reply(received, "xp /1wx 0x00000025").unwrap();
        assert_eq!(reply, "0000000000000025: 0x00000020");
        assert_eq!(parse_word(&reply), Some(0x20));
    }

    #[test]
    fn test_parse_word_rejects_garbage() {
        assert_eq!(parse_word("unknown command: 'xp'"), None);
        assert_eq!(parse_word(""), None);
    }

    #[test]
    fn test_render_command() {
        assert_eq!(render_command("xp /1wx {address}", 0x25, None), "xp /1wx 0x00000025");
        assert_eq!(
            render_command("poke {address} {value}", 0x25, Some(0x20)),
            "poke 0x00000025 0x00000020"
        );
    }
}
