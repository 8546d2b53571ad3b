//! Refinement prompt rendering.

use super::types::ValidationIssue;

/// Used when the config does not set `refinement.prompt_template`.
pub const DEFAULT_REFINEMENT_TEMPLATE: &str = "\
The following SQL query for an OMOP CDM database failed validation:

{sql_query}

Issues found:
{issues}

Rewrite the query so that it resolves every issue above. \
Return only the corrected SQL.";

/// One issue per line, `- [rule] message`.
pub fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("- {issue}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Substitute `{sql_query}` and `{issues}` into `template`.
///
/// Substitution is single-pass: placeholder text appearing inside the SQL
/// or the issues is left alone.
pub fn render_refinement_prompt(template: &str, sql: &str, issues: &[ValidationIssue]) -> String {
    let issues = format_issues(issues);
    template
        .split("{sql_query}")
        .map(|part| part.replace("{issues}", &issues))
        .collect::<Vec<_>>()
        .join(sql)
}

/// Append `new` issues not already in `seen`, keeping first-seen order.
pub fn accumulate_issues(seen: &mut Vec<ValidationIssue>, new: &[ValidationIssue]) {
    for issue in new {
        if !seen.contains(issue) {
            seen.push(issue.clone());
        }
    }
}
