mod env;

pub(crate) use env::get_env_with_prefix;

/// Generate a globally unique job id (UUID v4).
pub(crate) fn unique_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
