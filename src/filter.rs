//! Falcon Query Language (FQL) filter construction.

/// Exact-match clause: `field:'value'`.
///
/// Values are substituted literally. A value containing `'` ends up
/// un-escaped in the clause, which the upstream rejects as a malformed
/// expression rather than matching anything; kept literal to match the
/// upstream query contract.
pub fn exact(field: &str, value: &str) -> String {
    format!("{field}:'{value}'")
}

/// Optional search criteria for indicator queries. Clause order is fixed so
/// identical input always yields the identical filter string.
#[derive(Debug, Clone, Default)]
pub struct IndicatorFilter {
    pub indicator: Option<String>,
    pub indicator_type: Option<String>,
    pub malware_family: Option<String>,
    pub threat_type: Option<String>,
    pub malicious_confidence: Option<String>,
    pub published_after: Option<String>,
    pub mitre_technique: Option<String>,
}

impl IndicatorFilter {
    /// Joins the present clauses with `+` (FQL conjunction). No criteria
    /// means no filter, never an empty string.
    pub fn build(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(value) = present(&self.indicator) {
            clauses.push(exact("indicator", value));
        }
        if let Some(value) = present(&self.indicator_type) {
            clauses.push(exact("type", value));
        }
        if let Some(value) = present(&self.malware_family) {
            clauses.push(exact("malware_families", value));
        }
        if let Some(value) = present(&self.threat_type) {
            clauses.push(exact("threat_types", value));
        }
        if let Some(value) = present(&self.malicious_confidence) {
            clauses.push(exact("malicious_confidence", value));
        }
        if let Some(value) = present(&self.published_after) {
            clauses.push(format!("published_date:>'{value}'"));
        }
        if let Some(value) = present(&self.mitre_technique) {
            clauses.push(format!("labels.name:*'MitreATTCK/*{value}*'"));
        }

        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join("+"))
        }
    }
}

/// Empty strings count as "no constraint", same as absent values.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
