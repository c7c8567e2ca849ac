//! Input validation and sanitization functions for the simulator
//!
//! Everything a user types ends up echoed back to a client terminal, so all
//! free text passes through [`escape_html`] before it is stored in a log entry
//! or rendered in command output.

use std::net::Ipv4Addr;

/// Escapes text for safe display in an HTML client.
///
/// Replaces `&`, `<`, `>`, `"` and `'` with their entity forms.
///
/// # Examples
///
/// ```
/// use fwsim::validators::escape_html;
///
/// assert_eq!(escape_html("<b>"), "&lt;b&gt;");
/// assert_eq!(escape_html("10.0.0.1"), "10.0.0.1");
/// ```
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Validates a dotted-quad IPv4 literal.
///
/// # Errors
///
/// Returns `Err` with a display-safe message if the literal is not a
/// well-formed IPv4 address.
pub fn validate_ipv4(input: &str) -> Result<Ipv4Addr, String> {
    input
        .parse::<Ipv4Addr>()
        .map_err(|_| format!("Invalid IP address: {}", escape_html(input)))
}

/// Validates a single port number given as text.
///
/// # Errors
///
/// Returns `Err` if the text is not a number in 1..=65535.
pub fn validate_port(input: &str) -> Result<u16, String> {
    match input.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!(
            "Invalid port: {} (must be between 1 and 65535)",
            escape_html(input)
        )),
        Ok(port) => Ok(port),
    }
}

/// Parses an nmap-style port specification.
///
/// Accepts a comma list (`80,443`), an inclusive range (`1-1000`) or a single
/// port. Ranges are capped at 65535 entries by construction of `u16`.
///
/// # Errors
///
/// Returns `Err` if any port is malformed or a range is reversed.
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>, String> {
    if spec.contains(',') {
        return spec.split(',').map(validate_port).collect();
    }

    if let Some((start, end)) = spec.split_once('-') {
        let start = validate_port(start)?;
        let end = validate_port(end)?;
        if start > end {
            return Err("Start port must be less than or equal to end port".to_string());
        }
        return Ok((start..=end).collect());
    }

    validate_port(spec).map(|p| vec![p])
}
