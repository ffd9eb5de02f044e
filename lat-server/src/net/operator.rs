//! Operator event socket shim (§4.9): a TCP server accepting infield-device
//! connections, parsing the query/command grammar (§6) and dispatching
//! commands into the Ground-Truth Event Tracker (C12) — grounded on the
//! source's `infield_device_server.py` regex dispatch.

use lat_types::GroundTruthAction;

/// One parsed line from an operator connection.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorMessage {
    TagsQuery,
    ReferenceQuery,
    Command {
        tag_id: u32,
        reference: String,
        action: GroundTruthAction,
    },
}

/// A line failed to match any recognised query or command form.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unrecognised operator line: {0:?}")]
pub struct OperatorParseError(pub String);

/// Parse one line from an accepted operator connection. Queries end in `?`,
/// commands end in `.` (§6).
pub fn parse_line(line: &str) -> Result<OperatorMessage, OperatorParseError> {
    let trimmed = line.trim();
    if trimmed == "tags?" {
        return Ok(OperatorMessage::TagsQuery);
    }
    if trimmed == "reference?" {
        return Ok(OperatorMessage::ReferenceQuery);
    }

    let Some(body) = trimmed.strip_suffix('.') else {
        return Err(OperatorParseError(line.to_string()));
    };

    let words: Vec<&str> = body.split_whitespace().collect();
    // "Tag <N> Arrived at Reference <R>" | "Tag <N> Passed Reference <R>" |
    // "Tag <N> Left Reference <R>" | "Tag <N> Abandoned Reference <R>"
    if words.len() < 5 || words[0] != "Tag" {
        return Err(OperatorParseError(line.to_string()));
    }
    let tag_id: u32 = words[1]
        .parse()
        .map_err(|_| OperatorParseError(line.to_string()))?;

    let (action, reference_words) = match words[2] {
        "Arrived" if words.get(3) == Some(&"at") && words.get(4) == Some(&"Reference") => {
            (GroundTruthAction::Arrived, &words[5..])
        }
        "Passed" if words.get(3) == Some(&"Reference") => {
            (GroundTruthAction::Passed, &words[4..])
        }
        "Left" if words.get(3) == Some(&"Reference") => {
            (GroundTruthAction::Heading, &words[4..])
        }
        "Abandoned" if words.get(3) == Some(&"Reference") => {
            (GroundTruthAction::Abandoned, &words[4..])
        }
        _ => return Err(OperatorParseError(line.to_string())),
    };
    if reference_words.is_empty() {
        return Err(OperatorParseError(line.to_string()));
    }

    Ok(OperatorMessage::Command {
        tag_id,
        reference: reference_words.join(" "),
        action,
    })
}

pub fn format_tags_reply(tag_ids: &[u32]) -> String {
    let joined = tag_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    format!("Tag IDs: {}", joined)
}

pub fn format_reference_reply(labels: &[String]) -> String {
    format!("Reference Points: {}", labels.join(" "))
}
