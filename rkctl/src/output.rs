//! Human-readable rendering of server replies.

use crate::operator::LicenseReply;

/// Render `key = value` rows with the `=` signs aligned.
pub fn format_kv(rows: &[(&str, String)]) -> String {
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    rows.iter()
        .map(|(k, v)| format!("{k:<width$} = {v}\n"))
        .collect()
}

pub fn format_license_reply(reply: &LicenseReply) -> String {
    let features = if reply.features.is_empty() {
        "<none>".to_string()
    } else {
        reply.features.join(", ")
    };
    let mut out = format_kv(&[
        ("Product", reply.product.clone()),
        ("License ID", reply.license_id.clone()),
        ("Customer ID", reply.customer_id.clone()),
        ("Issued At", reply.issue_time.clone()),
        ("Expires At", reply.expiration_time.clone()),
        ("Features", features),
    ]);
    for warning in &reply.warnings {
        out.push_str(&format!("\nWARNING: {warning}\n"));
    }
    out
}
