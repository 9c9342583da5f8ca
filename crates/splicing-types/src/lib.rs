mod event;
mod message;
mod pipeline;
mod provider;
mod tool;

pub use event::*;
pub use message::*;
pub use pipeline::*;
pub use provider::*;
pub use tool::*;

/// Generates an opaque entity identifier: 10 lowercase alphanumeric characters.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(10)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_short_and_alphanumeric() {
        let id = generate_id();
        assert_eq!(id.len(), 10);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(id, generate_id());
    }
}
