//! End-of-call feedback parsing.
//!
//! The closing phase of a call may contain an explicit rating ("I'd say
//! four out of five") or a sentiment the agent can map onto the 1..=5
//! scale. The parser only enriches the call context; reward emission
//! stays with the FSM's terminal transition.

/// Extract a 1..=5 rating from a caller utterance.
///
/// A standalone digit wins over sentiment keywords; keywords are checked
/// from the strongest rating downward.
pub fn parse_rating(response: &str) -> Option<u8> {
    let text = response.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }

    // Standalone digit 1-5, e.g. "rating: 4" or "a 5 from me".
    for token in text.split(|c: char| !c.is_ascii_digit()) {
        if token.len() == 1
            && let Ok(n) = token.parse::<u8>()
            && (1..=5).contains(&n)
        {
            return Some(n);
        }
    }

    const WORDS: [(u8, &[&str]); 5] = [
        (5, &["excellent", "perfect", "outstanding", "amazing", "five stars"]),
        (4, &["good", "satisfied", "helpful", "nice"]),
        (3, &["okay", "ok", "average", "fine", "so-so"]),
        (2, &["not good", "bad", "disappointed", "unsatisfied"]),
        (1, &["terrible", "awful", "horrible", "useless", "not at all"]),
    ];
    for (rating, words) in WORDS {
        for word in words {
            if text.contains(word) {
                return Some(rating);
            }
        }
    }

    None
}

/// Whether an utterance signals the caller asked for a human.
pub fn mentions_handover(response: &str) -> bool {
    let text = response.to_lowercase();
    ["human", "real person", "agent", "representative", "operator"]
        .iter()
        .any(|phrase| text.contains(phrase))
}
