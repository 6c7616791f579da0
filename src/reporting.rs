// Reporting and output for Surrogate
// CSV, JSON and HTML export of the result log. Columns follow the results
// table: one length/status pair for the unauthenticated replay and one per
// profile, in profile order.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Local;
use serde::Serialize;

use crate::log::{LogEntry, ReplayResult};
use crate::profile::ProfileId;
use crate::state::Settings;
use crate::verdict::Verdict;

/// Which rows an HTML report keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFilter {
    #[default]
    All,
    /// Same rows the results table shows under the current `show_*` flags
    AsTableFilter,
    /// Rows where the unauthenticated replay or any profile got this verdict
    Verdict(Verdict),
}

impl fmt::Display for ReportFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFilter::All => f.write_str("All Statuses"),
            ReportFilter::AsTableFilter => f.write_str("As table filter"),
            ReportFilter::Verdict(v) => f.write_str(v.label()),
        }
    }
}

impl FromStr for ReportFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "all statuses" => Ok(ReportFilter::All),
            "table" | "as-table" | "as table filter" => Ok(ReportFilter::AsTableFilter),
            other => Verdict::from_label(other)
                .map(ReportFilter::Verdict)
                .ok_or_else(|| format!("unknown report filter '{}'", s)),
        }
    }
}

impl ReportFilter {
    pub fn keeps(&self, entry: &LogEntry, settings: &Settings) -> bool {
        match self {
            ReportFilter::All => true,
            ReportFilter::AsTableFilter => {
                if settings.show_bypassed && settings.show_enforced && settings.show_unknown {
                    return true;
                }
                let unauth = entry.unauth_verdict();
                if unauth == Verdict::Disabled {
                    return true;
                }
                std::iter::once(unauth)
                    .chain(entry.profile_verdicts())
                    .any(|v| shown_in_table(v, settings))
            }
            ReportFilter::Verdict(wanted) => {
                entry.unauth_verdict() == *wanted || entry.profile_verdicts().contains(wanted)
            }
        }
    }
}

fn shown_in_table(verdict: Verdict, settings: &Settings) -> bool {
    match verdict {
        Verdict::Bypassed => settings.show_bypassed,
        Verdict::Enforced => settings.show_enforced,
        Verdict::Unknown => settings.show_unknown,
        Verdict::Disabled => false,
    }
}

/// Escape CSV field to prevent formula injection attacks
/// Cells starting with =, +, -, @, or tab are prefixed with single quote
fn escape_csv_field(field: &str) -> String {
    let needs_escaping = field.starts_with(['=', '+', '-', '@', '\t']);

    if needs_escaping {
        format!("\"'{}\"", field.replace('"', "\"\""))
    } else if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn response_len(result: Option<&ReplayResult>) -> usize {
    result.and_then(|r| r.response()).map_or(0, |r| r.body.len())
}

fn unauth_len(entry: &LogEntry) -> usize {
    response_len(entry.unauthenticated.as_ref())
}

/// Length and label of one profile's replay, `(0, "")` when it has not reported.
fn profile_cell(entry: &LogEntry, id: ProfileId) -> (usize, &'static str) {
    match entry.profile_result(id) {
        Some(result) => (response_len(Some(&result)), result.label()),
        None => (0, ""),
    }
}

fn css_class(label: &str) -> &'static str {
    match Verdict::from_label(label) {
        Some(Verdict::Disabled) => "disabled",
        Some(Verdict::Bypassed) => "bypassed",
        Some(Verdict::Unknown) => "unknown",
        Some(Verdict::Enforced) => "enforced",
        None => "",
    }
}

pub fn render_csv(entries: &[Arc<LogEntry>], profiles: &[(ProfileId, String)]) -> String {
    let mut out = String::from("ID,Method,URL,OrigLen,UnauthLen,UnauthStatus");
    for (_, name) in profiles {
        out.push(',');
        out.push_str(&escape_csv_field(&format!("{} Len", name)));
        out.push(',');
        out.push_str(&escape_csv_field(&format!("{} Status", name)));
    }
    out.push('\n');

    for entry in entries {
        out.push_str(&format!(
            "{},{},{},{},{},{}",
            entry.sequence,
            escape_csv_field(entry.method.as_str()),
            escape_csv_field(&entry.url),
            entry.original_len(),
            unauth_len(entry),
            escape_csv_field(entry.unauth_label()),
        ));
        for (id, _) in profiles {
            let (len, label) = profile_cell(entry, *id);
            out.push_str(&format!(",{},{}", len, escape_csv_field(label)));
        }
        out.push('\n');
    }
    out
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRow<'a> {
    id: u64,
    method: &'a str,
    url: &'a str,
    orig_len: usize,
    unauth_len: usize,
    unauth_status: &'static str,
    profiles: BTreeMap<&'a str, JsonCell>,
}

#[derive(Debug, Serialize)]
struct JsonCell {
    len: usize,
    status: &'static str,
}

pub fn render_json(entries: &[Arc<LogEntry>], profiles: &[(ProfileId, String)]) -> serde_json::Result<String> {
    let rows: Vec<JsonRow> = entries
        .iter()
        .map(|entry| JsonRow {
            id: entry.sequence,
            method: entry.method.as_str(),
            url: &entry.url,
            orig_len: entry.original_len(),
            unauth_len: unauth_len(entry),
            unauth_status: entry.unauth_label(),
            profiles: profiles
                .iter()
                .map(|(id, name)| {
                    let (len, status) = profile_cell(entry, *id);
                    (name.as_str(), JsonCell { len, status })
                })
                .collect(),
        })
        .collect();
    serde_json::to_string_pretty(&rows)
}

const HTML_STYLE: &str = "body{font-family:Arial,Helvetica,sans-serif;font-size:12px;}\
table{border-collapse:collapse;width:100%;}\
th,td{border:1px solid #e1eef4;padding:6px;}\
th{background:#006699;color:#fff;text-align:left;}\
.bypassed{background:#ff9999;}\
.unknown{background:#ffcc99;}\
.enforced{background:#ccff99;}\
.disabled{background:#d3d3d3;}";

pub fn render_html(
    entries: &[Arc<LogEntry>],
    profiles: &[(ProfileId, String)],
    filter: ReportFilter,
    settings: &Settings,
) -> String {
    let mut out = String::new();
    out.push_str("<html><head><meta charset=\"utf-8\"/><title>Surrogate Report</title>");
    out.push_str(&format!("<style>{}</style></head><body>", HTML_STYLE));
    out.push_str("<h1>Surrogate Report</h1>");
    out.push_str(&format!("<p>Filter: {}</p>", escape_html(&filter.to_string())));

    out.push_str("<table><thead><tr>");
    out.push_str("<th>ID</th><th>Method</th><th>URL</th><th>Orig Len</th><th>Unauth Len</th><th>Unauth Status</th>");
    for (_, name) in profiles {
        let name = escape_html(name);
        out.push_str(&format!("<th>{} Len</th><th>{} Status</th>", name, name));
    }
    out.push_str("</tr></thead><tbody>");

    for entry in entries.iter().filter(|e| filter.keeps(e, settings)) {
        let unauth = entry.unauth_label();
        out.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td class=\"{}\">{}</td>",
            entry.sequence,
            escape_html(entry.method.as_str()),
            escape_html(&entry.url),
            entry.original_len(),
            unauth_len(entry),
            css_class(unauth),
            escape_html(unauth),
        ));
        for (id, _) in profiles {
            let (len, label) = profile_cell(entry, *id);
            out.push_str(&format!(
                "<td>{}</td><td class=\"{}\">{}</td>",
                len,
                css_class(label),
                escape_html(label)
            ));
        }
        out.push_str("</tr>");
    }

    out.push_str("</tbody></table></body></html>");
    out
}

fn write_report(dir: &Path, extension: &str, contents: &str) -> Result<String, std::io::Error> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let filename = dir.join(format!("surrogate_report_{}.{}", timestamp, extension));
    let mut file = File::create(&filename)?;
    file.write_all(contents.as_bytes())?;
    Ok(filename.display().to_string())
}

pub fn export_csv(
    entries: &[Arc<LogEntry>],
    profiles: &[(ProfileId, String)],
    dir: &Path,
) -> Result<String, std::io::Error> {
    write_report(dir, "csv", &render_csv(entries, profiles))
}

pub fn export_json(
    entries: &[Arc<LogEntry>],
    profiles: &[(ProfileId, String)],
    dir: &Path,
) -> Result<String, std::io::Error> {
    let json = render_json(entries, profiles)?;
    write_report(dir, "json", &json)
}

pub fn export_html(
    entries: &[Arc<LogEntry>],
    profiles: &[(ProfileId, String)],
    filter: ReportFilter,
    settings: &Settings,
    dir: &Path,
) -> Result<String, std::io::Error> {
    write_report(dir, "html", &render_html(entries, profiles, filter, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_fields_are_escaped() {
        assert_eq!(escape_csv_field("plain"), "plain");
        assert_eq!(escape_csv_field("=HYPERLINK(\"x\")"), "\"'=HYPERLINK(\"\"x\"\")\"");
        assert_eq!(escape_csv_field("a,b"), "\"a,b\"");
        assert_eq!(escape_csv_field("line\nbreak"), "\"line\nbreak\"");
        assert_eq!(escape_csv_field(""), "");
    }

    #[test]
    fn filter_parses_names_and_labels() {
        assert_eq!("all".parse::<ReportFilter>(), Ok(ReportFilter::All));
        assert_eq!("As table filter".parse::<ReportFilter>(), Ok(ReportFilter::AsTableFilter));
        assert_eq!(
            "Bypassed!".parse::<ReportFilter>(),
            Ok(ReportFilter::Verdict(Verdict::Bypassed))
        );
        assert_eq!("unknown".parse::<ReportFilter>(), Ok(ReportFilter::Verdict(Verdict::Unknown)));
        assert!("sideways".parse::<ReportFilter>().is_err());
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn css_classes_follow_labels() {
        assert_eq!(css_class("Bypassed!"), "bypassed");
        assert_eq!(css_class("Is enforced???"), "unknown");
        assert_eq!(css_class("Enforced!"), "enforced");
        assert_eq!(css_class("Disabled"), "disabled");
        assert_eq!(css_class("Error"), "");
    }
}
