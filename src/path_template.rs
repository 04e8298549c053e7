//! Path templates for transfer endpoints
//!
//! `local` and `remote` paths may embed `{{ .IP }}` (the target host address)
//! and `{{ .TIME }}` (local time as `YYYYMMDD_HHMMSS`), e.g.
//! `./backup/{{ .IP }}/app_{{ .TIME }}.log`.

use crate::error::{GossError, Result};
use chrono::{DateTime, Local};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
pub const TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Render `template` for host `ip` at the current local time
pub fn render(template: &str, ip: &str) -> Result<String> {
    render_at(template, ip, Local::now())
}

/// Render `template` for host `ip` at a fixed time
///
/// # Errors
///
/// Returns a `Validation` error for an unterminated `{{` or an unknown
/// variable.
pub fn render_at(template: &str, ip: &str, now: DateTime<Local>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open.find(CLOSE).ok_or_else(|| {
            GossError::validation(format!("unterminated template in path '{}'", template))
        })?;

        match after_open[..end].trim() {
            ".IP" => out.push_str(ip),
            ".TIME" => out.push_str(&now.format(TIME_FORMAT).to_string()),
            other => {
                return Err(GossError::validation(format!(
                    "unknown template variable '{}' in path '{}' (expected .IP or .TIME)",
                    other, template
                )))
            }
        }
        rest = &after_open[end + CLOSE.len()..];
    }
    out.push_str(rest);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
    }

    #[test]
    fn test_plain_path_untouched() {
        assert_eq!(render("/var/log/app.log", "10.0.0.1").unwrap(), "/var/log/app.log");
    }

    #[test]
    fn test_ip_and_time() {
        let rendered = render_at("./backup/{{ .IP }}/app_{{.TIME}}.log", "10.0.0.1", fixed_time()).unwrap();
        assert_eq!(rendered, "./backup/10.0.0.1/app_20240309_070501.log");
    }

    #[test]
    fn test_repeated_variables() {
        let rendered = render_at("{{ .IP }}-{{ .IP }}", "h", fixed_time()).unwrap();
        assert_eq!(rendered, "h-h");
    }

    #[test]
    fn test_unknown_variable() {
        let err = render("/tmp/{{ .HOST }}", "10.0.0.1").unwrap_err();
        assert!(err.message.contains(".HOST"));
    }

    #[test]
    fn test_unterminated() {
        assert!(render("/tmp/{{ .IP", "10.0.0.1").is_err());
    }
}
