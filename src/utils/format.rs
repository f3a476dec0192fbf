/// Format a price with two decimals, as shown in dry-run previews.
pub fn format_price(amount: f64) -> String {
    format!("{:.2}", amount)
}

/// Mask a secret for logs, keeping only its last four characters.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}
