//! Vendor CLI tokens as data
//!
//! Each table is a named list of patterns scanned against captured output.
//! Supporting another firmware's wording means adding a pattern here, not
//! touching the automaton.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Case-sensitive substring anywhere in the text.
    Contains(&'static str),
    /// Case-insensitive substring anywhere in the text.
    ContainsNoCase(&'static str),
    /// The last non-empty line ends with `suffix`; `config` selects whether
    /// that line is a configuration-mode prompt (`R1(config)#`).
    Prompt { suffix: &'static str, config: bool },
}

impl Pattern {
    fn token(&self) -> &'static str {
        match self {
            Pattern::Contains(t) | Pattern::ContainsNoCase(t) => t,
            Pattern::Prompt { suffix, .. } => suffix,
        }
    }

    fn matches(&self, text: &str, lowered: &str) -> bool {
        match self {
            Pattern::Contains(t) => text.contains(t),
            Pattern::ContainsNoCase(t) => lowered.contains(&t.to_ascii_lowercase()),
            Pattern::Prompt { suffix, config } => last_line(text)
                .is_some_and(|line| line.ends_with(suffix) && line.contains("(config") == *config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Matched(&'static str),
    Unmatched,
}

impl Scan {
    pub fn is_matched(self) -> bool {
        matches!(self, Scan::Matched(_))
    }

    pub fn token(self) -> Option<&'static str> {
        match self {
            Scan::Matched(t) => Some(t),
            Scan::Unmatched => None,
        }
    }
}

#[derive(Debug)]
pub struct TokenTable {
    pub name: &'static str,
    pub patterns: &'static [Pattern],
}

impl TokenTable {
    /// First pattern in table order that matches.
    pub fn scan(&self, text: &str) -> Scan {
        let lowered = text.to_ascii_lowercase();
        self.patterns
            .iter()
            .find(|p| p.matches(text, &lowered))
            .map_or(Scan::Unmatched, |p| Scan::Matched(p.token()))
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim_end).rev().find(|l| !l.is_empty())
}

pub static IOS_ERRORS: TokenTable = TokenTable {
    name: "ios-error",
    patterns: &[
        Pattern::ContainsNoCase("% invalid input"),
        Pattern::ContainsNoCase("invalid input detected"),
        Pattern::ContainsNoCase("% incomplete"),
        Pattern::ContainsNoCase("incomplete command"),
        Pattern::ContainsNoCase("% ambiguous"),
        Pattern::ContainsNoCase("unknown command"),
    ],
};

pub static PASSWORD_CHALLENGE: TokenTable = TokenTable {
    name: "password-challenge",
    patterns: &[Pattern::ContainsNoCase("password:")],
};

pub static ENABLE_DENIED: TokenTable = TokenTable {
    name: "enable-denied",
    patterns: &[
        Pattern::ContainsNoCase("% access denied"),
        Pattern::ContainsNoCase("% bad secrets"),
        Pattern::ContainsNoCase("% bad passwords"),
        Pattern::ContainsNoCase("% no password set"),
    ],
};

pub static USER_PROMPT: TokenTable = TokenTable {
    name: "user-prompt",
    patterns: &[Pattern::Prompt { suffix: ">", config: false }],
};

pub static PRIVILEGED_PROMPT: TokenTable = TokenTable {
    name: "privileged-prompt",
    patterns: &[Pattern::Prompt { suffix: "#", config: false }],
};

pub static CONFIG_PROMPT: TokenTable = TokenTable {
    name: "config-prompt",
    patterns: &[Pattern::Prompt { suffix: "#", config: true }],
};

pub static ANY_PROMPT: TokenTable = TokenTable {
    name: "any-prompt",
    patterns: &[
        Pattern::Prompt { suffix: "#", config: true },
        Pattern::Prompt { suffix: "#", config: false },
        Pattern::Prompt { suffix: ">", config: false },
    ],
};

/// What can follow `enable`: a challenge, or a prompt straight away.
pub static ENABLE_REPLY: TokenTable = TokenTable {
    name: "enable-reply",
    patterns: &[
        Pattern::ContainsNoCase("password:"),
        Pattern::Prompt { suffix: "#", config: false },
        Pattern::Prompt { suffix: ">", config: false },
    ],
};

/// Ping output is complete once the exec prompt comes back.
pub static PING_COMPLETE: TokenTable = TokenTable {
    name: "ping-complete",
    patterns: &[
        Pattern::Prompt { suffix: "#", config: false },
        Pattern::Prompt { suffix: ">", config: false },
    ],
};

/// stderr of `sudo -S` when the piped password was refused.
pub static SUDO_AUTH_FAILURES: TokenTable = TokenTable {
    name: "sudo-auth",
    patterns: &[
        Pattern::ContainsNoCase("sorry, try again"),
        Pattern::ContainsNoCase("incorrect password"),
        Pattern::ContainsNoCase("a password is required"),
        Pattern::ContainsNoCase("is not in the sudoers file"),
    ],
};

/// Decide whether CLI ping output shows the target answering.
///
/// Checked in order, first decisive heuristic wins: the
/// "Success rate is N percent" summary, a line of `!`/`.` echo glyphs, then
/// generic "reply"/"bytes from" wording from non-IOS firmwares.
pub fn ping_verdict(output: &str) -> bool {
    let lowered = output.to_ascii_lowercase();
    if let Some(idx) = lowered.find("success rate is") {
        let digits: String = lowered[idx + "success rate is".len()..]
            .trim_start()
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        if let Ok(rate) = digits.parse::<u32>() {
            return rate > 0;
        }
    }

    let glyph_line = output.lines().map(str::trim).find(|l| {
        !l.is_empty() && l.chars().all(|c| matches!(c, '!' | '.' | 'U' | 'Q' | 'M' | '?' | '&'))
            && l.chars().any(|c| matches!(c, '!' | '.'))
    });
    if let Some(line) = glyph_line {
        return line.contains('!');
    }

    lowered.contains("reply from") || lowered.contains("bytes from")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_tables_distinguish_modes() {
        assert_eq!(USER_PROMPT.scan("banner\r\nR1>"), Scan::Matched(">"));
        assert_eq!(PRIVILEGED_PROMPT.scan("R1>enable\r\nR1#"), Scan::Matched("#"));
        assert_eq!(PRIVILEGED_PROMPT.scan("R1(config)#"), Scan::Unmatched);
        assert_eq!(CONFIG_PROMPT.scan("configure terminal\r\nR1(config)#  \r\n"), Scan::Matched("#"));
        assert_eq!(CONFIG_PROMPT.scan("R1#"), Scan::Unmatched);
    }

    #[test]
    fn test_ios_error_tokens() {
        let out = "R1(config)#ip rute 10.0.0.2\r\n        ^\r\n% Invalid input detected at '^' marker.\r\n";
        assert_eq!(IOS_ERRORS.scan(out), Scan::Matched("% invalid input"));
        assert_eq!(IOS_ERRORS.scan("% Incomplete command.\r\n"), Scan::Matched("% incomplete"));
        assert!(!IOS_ERRORS.scan("R1(config)#ip route 10.0.0.2 255.255.255.255 Null0\r\n").is_matched());
    }

    #[test]
    fn test_ping_verdict_success_rate() {
        let ok = "Sending 3, 100-byte ICMP Echos to 10.0.0.2, timeout is 2 seconds:\r\n!!!\r\n\
                  Success rate is 100 percent (3/3), round-trip min/avg/max = 1/2/4 ms\r\nR1#";
        assert!(ping_verdict(ok));
        let partial = "!.!\r\nSuccess rate is 66 percent (2/3)";
        assert!(ping_verdict(partial));
        let dead = "Sending 3, 100-byte ICMP Echos to 10.0.0.9, timeout is 2 seconds:\r\n...\r\n\
                    Success rate is 0 percent (0/3)\r\nR1#";
        assert!(!ping_verdict(dead));
    }

    #[test]
    fn test_ping_verdict_fallback_heuristics() {
        // summary cut off by the deadline, glyphs still tell
        assert!(ping_verdict("Type escape sequence to abort.\r\n.!!"));
        assert!(!ping_verdict("Type escape sequence to abort.\r\n..."));
        assert!(ping_verdict("64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=0.3 ms"));
        assert!(ping_verdict("Reply from 10.0.0.2: bytes=32"));
        assert!(!ping_verdict("% Unrecognized host or address"));
    }
}
