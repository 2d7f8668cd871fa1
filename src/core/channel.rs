// Channel name validation shared by the notifier, stores, server, and CLI.
use crate::core::error::{Error, ErrorKind};

pub const NEW_ORDER_CHANNEL: &str = "new_order_notification";

const MAX_CHANNEL_LEN: usize = 128;

pub fn validate_channel(channel: &str) -> Result<(), Error> {
    if channel.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("channel name must not be empty")
            .with_hint("Use a name like new_order_notification."));
    }
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("channel name exceeds {MAX_CHANNEL_LEN} bytes"))
            .with_channel(channel));
    }
    if channel.starts_with('.') {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("channel name must not start with '.'")
            .with_channel(channel));
    }
    let valid = channel
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.'));
    if !valid {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("channel name contains invalid characters")
            .with_channel(channel)
            .with_hint("Use ASCII letters, digits, '_', '-', or '.'."));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{NEW_ORDER_CHANNEL, validate_channel};
    use crate::core::error::ErrorKind;

    #[test]
    fn accepts_typical_names() {
        for name in [NEW_ORDER_CHANNEL, "orders", "shop-42.refunds", "A_b-C.d"] {
            validate_channel(name).expect("valid channel");
        }
    }

    #[test]
    fn rejects_path_like_and_empty_names() {
        for name in ["", "../orders", "a/b", ".hidden", "spaced name", "é"] {
            let err = validate_channel(name).expect_err("invalid channel");
            assert_eq!(err.kind(), ErrorKind::Usage, "name: {name:?}");
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let name = "x".repeat(129);
        assert!(validate_channel(&name).is_err());
        validate_channel(&"x".repeat(128)).expect("boundary length");
    }
}
