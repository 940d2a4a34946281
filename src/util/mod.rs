pub mod async_flag;
pub mod backoff;
pub mod drop_guard;
pub mod event_bus;
pub mod fs;
pub mod runnable;

use rand::Rng;

/// Freshly minted opaque identifier, 16 hex characters.
pub fn token_generate() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::token_generate;

    #[test]
    fn tokens_are_well_formed_and_distinct() {
        let first = token_generate();
        let second = token_generate();

        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }
}
