/// Splits one CSV line into trimmed values.
///
/// A `"` toggles quoted mode and is dropped; a comma only separates values
/// outside quoted mode. Doubled quotes are not unescaped, and an unterminated
/// quote runs to the end of the line.
pub fn parse_line(line: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                values.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }

    values.push(current.trim().to_string());
    values
}
