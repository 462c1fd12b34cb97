//! Result aggregation read model.
//!
//! Pure functions over a loaded [`PollAggregate`]: per-option tallies,
//! participant sets, and the participant × option matrix behind the CSV
//! export. Votes are de-duplicated by (voter identity, option) keeping the
//! newest row: max(updated_at), then max(id). Downstream exports rely on
//! that exact rule.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::model::{Poll, PollAggregate, PollKind, PollOption, Vote, VoteResponse};

/// Tallies for one option. Score weighs yes double so schedule polls can
/// rank options with maybes in between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionStats {
    pub yes_count: i64,
    pub maybe_count: i64,
    pub no_count: i64,
    pub score: i64,
}

/// The aggregated read model for one poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResults {
    pub options: Vec<PollOption>,
    pub votes: Vec<Vote>,
    pub stats: BTreeMap<i64, OptionStats>,
    pub participant_count: usize,
    /// Percentage. An invited-set is not modelled, so this reports 100 once
    /// anyone has voted.
    pub response_rate: u32,
}

/// A vote's identity for dedup purposes: email when present, voter key
/// otherwise.
fn vote_identity(vote: &Vote) -> &str {
    if vote.voter_email.is_empty() {
        &vote.voter_key
    } else {
        &vote.voter_email
    }
}

/// De-duplicate votes to one row per (voter identity, option), newest wins.
fn dedup_votes(votes: &[Vote]) -> Vec<Vote> {
    let mut newest: HashMap<(String, i64), &Vote> = HashMap::new();
    for vote in votes {
        let key = (vote_identity(vote).to_string(), vote.option_id);
        match newest.get(&key) {
            Some(existing)
                if (existing.updated_at, existing.id) >= (vote.updated_at, vote.id) => {}
            _ => {
                newest.insert(key, vote);
            }
        }
    }
    let mut result: Vec<Vote> = newest.into_values().cloned().collect();
    result.sort_by_key(|v| v.id);
    result
}

/// Build the read model for a poll.
pub fn aggregate(agg: &PollAggregate) -> PollResults {
    let votes = dedup_votes(&agg.votes);

    let mut stats: BTreeMap<i64, OptionStats> = agg
        .options
        .iter()
        .map(|o| (o.id, OptionStats::default()))
        .collect();
    for vote in &votes {
        let Some(entry) = stats.get_mut(&vote.option_id) else {
            continue;
        };
        match vote.response {
            VoteResponse::Yes => entry.yes_count += 1,
            VoteResponse::Maybe => entry.maybe_count += 1,
            VoteResponse::No => entry.no_count += 1,
        }
    }
    for entry in stats.values_mut() {
        entry.score = 2 * entry.yes_count + entry.maybe_count;
    }

    let participant_count = participants(&votes).len();
    let response_rate = if participant_count > 0 { 100 } else { 0 };

    PollResults {
        options: agg.options.clone(),
        votes,
        stats,
        participant_count,
        response_rate,
    }
}

/// Distinct voter identities in insertion order, with the display name of
/// their first row.
fn participants(votes: &[Vote]) -> Vec<(String, String)> {
    let mut seen: Vec<(String, String)> = Vec::new();
    for vote in votes {
        let identity = vote_identity(vote);
        if !seen.iter().any(|(id, _)| id == identity) {
            seen.push((identity.to_string(), vote.voter_name.clone()));
        }
    }
    seen
}

/// Localisable cell labels for the export matrix.
#[derive(Debug, Clone)]
pub struct CellLabels {
    pub yes: String,
    pub maybe: String,
    pub no: String,
    pub blank: String,
    pub participant_header: String,
    pub total_label: String,
}

impl Default for CellLabels {
    fn default() -> Self {
        Self {
            yes: "Yes".into(),
            maybe: "Maybe".into(),
            no: "No".into(),
            blank: String::new(),
            participant_header: "Participant".into(),
            total_label: "Total".into(),
        }
    }
}

/// Participant × option matrix: header, optional date row for schedule
/// polls, one row per participant in insertion order, and a totals row
/// summing yes + maybe per option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMatrix {
    pub header: Vec<String>,
    pub date_row: Option<Vec<String>>,
    pub rows: Vec<Vec<String>>,
    pub totals: Vec<String>,
}

/// Build the export matrix from a poll and its (already de-duplicated)
/// results.
pub fn matrix(poll: &Poll, results: &PollResults, labels: &CellLabels) -> ResultMatrix {
    let mut header = Vec::with_capacity(results.options.len() + 1);
    header.push(labels.participant_header.clone());
    header.extend(results.options.iter().map(|o| o.text.clone()));

    let date_row = (poll.kind == PollKind::Schedule).then(|| {
        let mut row = Vec::with_capacity(results.options.len() + 1);
        row.push(String::new());
        row.extend(results.options.iter().map(|o| match (o.start_time, o.end_time) {
            (Some(start), Some(end)) => format!(
                "{} - {}",
                start.format("%Y-%m-%d %H:%M"),
                end.format("%H:%M")
            ),
            (Some(start), None) => start.format("%Y-%m-%d %H:%M").to_string(),
            _ => String::new(),
        }));
        row
    });

    let by_voter_and_option: HashMap<(&str, i64), &Vote> = results
        .votes
        .iter()
        .map(|v| ((vote_identity(v), v.option_id), v))
        .collect();

    let rows = participants(&results.votes)
        .into_iter()
        .map(|(identity, name)| {
            let mut row = Vec::with_capacity(results.options.len() + 1);
            row.push(name);
            for option in &results.options {
                let cell = match by_voter_and_option.get(&(identity.as_str(), option.id)) {
                    Some(vote) => match vote.response {
                        VoteResponse::Yes => labels.yes.clone(),
                        VoteResponse::Maybe => labels.maybe.clone(),
                        VoteResponse::No => labels.no.clone(),
                    },
                    None => labels.blank.clone(),
                };
                row.push(cell);
            }
            row
        })
        .collect();

    let mut totals = Vec::with_capacity(results.options.len() + 1);
    totals.push(labels.total_label.clone());
    for option in &results.options {
        let stats = results.stats.get(&option.id).copied().unwrap_or_default();
        totals.push((stats.yes_count + stats.maybe_count).to_string());
    }

    ResultMatrix {
        header,
        date_row,
        rows,
        totals,
    }
}

/// Render a matrix as CSV with RFC 4180 quoting.
pub fn to_csv(matrix: &ResultMatrix) -> String {
    let mut out = String::new();
    let mut write_row = |row: &[String]| {
        let encoded: Vec<String> = row.iter().map(|cell| csv_escape(cell)).collect();
        out.push_str(&encoded.join(","));
        out.push_str("\r\n");
    };

    write_row(&matrix.header);
    if let Some(date_row) = &matrix.date_row {
        write_row(date_row);
    }
    for row in &matrix.rows {
        write_row(row);
    }
    write_row(&matrix.totals);
    out
}

fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Result-visibility rule: private results are readable by the admin-token
/// holder and the creator only.
pub fn can_view_results(poll: &Poll, via_admin_token: bool, user_id: Option<i64>) -> bool {
    if poll.flags.results_public || via_admin_token {
        return true;
    }
    match (poll.creator_user_id, user_id) {
        (Some(creator), Some(user)) => creator == user,
        _ => false,
    }
}
