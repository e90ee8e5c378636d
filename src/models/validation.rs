use std::ops::RangeInclusive;

use anyhow::{Result, anyhow};

const DEVICE_TOKEN_LEN: RangeInclusive<usize> = 20..=200;
const MAX_EMAIL_LEN: usize = 254;

/// Checks the shape of an FCM registration token before it is sent anywhere.
pub fn validate_device_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(anyhow!("Device token cannot be empty"));
    }

    if !DEVICE_TOKEN_LEN.contains(&token.len()) {
        return Err(anyhow!(
            "Device token must be {} to {} characters, got {}",
            DEVICE_TOKEN_LEN.start(),
            DEVICE_TOKEN_LEN.end(),
            token.len()
        ));
    }

    if let Some(bad) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')))
    {
        return Err(anyhow!("Device token contains invalid character {:?}", bad));
    }

    Ok(())
}

/// Loose shape check; deliverability is the mail relay's problem.
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_ascii_lowercase();

    let Some((local, domain)) = email.split_once('@') else {
        return Err(anyhow!("Email address must contain '@'"));
    };

    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(anyhow!("Email address is malformed"));
    }

    if email.len() > MAX_EMAIL_LEN {
        return Err(anyhow!("Email address too long"));
    }

    Ok(email)
}
