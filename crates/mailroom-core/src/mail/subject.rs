//! Subject prefixes and normalization for threading.

/// Reply and forward prefixes stripped when grouping conversations.
const PREFIXES: &[&str] = &["re", "fw", "fwd", "aw", "sv", "vs", "tr", "wg"];

/// Lowercases, removes leading reply/forward prefixes (including counted
/// forms like `Re[2]:`) and `[list]` tags, and collapses whitespace.
#[must_use]
pub fn normalize_subject(subject: &str) -> String {
    let mut rest = subject.trim();
    loop {
        let before = rest;
        rest = strip_prefix(rest).trim_start();
        if rest.starts_with('[') {
            if let Some(end) = rest.find(']') {
                rest = rest[end + 1..].trim_start();
            }
        }
        if rest == before {
            break;
        }
    }
    rest.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `Re: subject`, without stacking prefixes.
#[must_use]
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if has_prefix(trimmed, &["re"]) {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

/// `Fwd: subject`, without stacking prefixes.
#[must_use]
pub fn forward_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if has_prefix(trimmed, &["fwd", "fw"]) {
        trimmed.to_string()
    } else {
        format!("Fwd: {trimmed}")
    }
}

fn has_prefix(subject: &str, names: &[&str]) -> bool {
    subject.split_once(':').is_some_and(|(head, _)| {
        let head = head.split('[').next().unwrap_or(head).trim();
        names.iter().any(|n| head.eq_ignore_ascii_case(n))
    })
}

fn strip_prefix(subject: &str) -> &str {
    let Some((head, tail)) = subject.split_once(':') else {
        return subject;
    };
    let word = head.split('[').next().unwrap_or(head).trim();
    let counted_ok = head
        .find('[')
        .is_none_or(|i| head[i..].trim_end().ends_with(']'));
    if counted_ok && PREFIXES.iter().any(|p| word.eq_ignore_ascii_case(p)) {
        tail
    } else {
        subject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_prefixes() {
        assert_eq!(normalize_subject("Re: Lunch"), "lunch");
        assert_eq!(normalize_subject("RE: Fwd: re:  Lunch   plans"), "lunch plans");
        assert_eq!(normalize_subject("Re[2]: Lunch"), "lunch");
        assert_eq!(normalize_subject("AW: [team] Lunch"), "lunch");
        assert_eq!(normalize_subject("Lunch"), "lunch");
        assert_eq!(normalize_subject(""), "");
    }

    #[test]
    fn colons_inside_subjects_survive() {
        assert_eq!(normalize_subject("Agenda: Monday"), "agenda: monday");
        assert_eq!(normalize_subject("Re: Agenda: Monday"), "agenda: monday");
    }

    #[test]
    fn prefixes_do_not_stack() {
        assert_eq!(reply_subject("Lunch"), "Re: Lunch");
        assert_eq!(reply_subject("RE: Lunch"), "RE: Lunch");
        assert_eq!(forward_subject("Lunch"), "Fwd: Lunch");
        assert_eq!(forward_subject("FW: Lunch"), "FW: Lunch");
        assert_eq!(forward_subject("Re: Lunch"), "Fwd: Re: Lunch");
    }
}
