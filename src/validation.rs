use uuid::Uuid;

use crate::error::{AppError, Result};

/// A resource name ends up inside a single stdin line (`start <name>`), so it
/// must be one plain path segment without control characters.
pub fn is_valid_resource_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.chars().any(|c| c.is_control() || matches!(c, '/' | '\\'))
}

/// Resolve a full or abbreviated instance id against the known ids.
pub fn resolve_instance_id<'a, I>(input: &str, known: I) -> Result<Uuid>
where
    I: IntoIterator<Item = &'a Uuid>,
{
    if let Ok(id) = Uuid::parse_str(input) {
        return Ok(id);
    }
    let needle = input.to_ascii_lowercase();
    if needle.is_empty() {
        return Err(AppError::instance_not_found(input));
    }
    let mut matches = known
        .into_iter()
        .filter(|id| id.to_string().starts_with(&needle));
    match (matches.next(), matches.next()) {
        (Some(id), None) => Ok(*id),
        (Some(_), Some(_)) => Err(AppError::other(format!("Ambiguous instance id {}", input))),
        _ => Err(AppError::instance_not_found(input)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names() {
        assert!(is_valid_resource_name("freeroam"));
        assert!(is_valid_resource_name("race-v2.1"));
        assert!(is_valid_resource_name("my resource"));
        assert!(!is_valid_resource_name(""));
        assert!(!is_valid_resource_name(".."));
        assert!(!is_valid_resource_name("a/b"));
        assert!(!is_valid_resource_name("a\nstop b"));
    }

    #[test]
    fn prefix_resolution() {
        let a = Uuid::parse_str("6f1c1b2a-0000-4000-8000-000000000001").unwrap();
        let b = Uuid::parse_str("6f2d0000-0000-4000-8000-000000000002").unwrap();
        let known = [a, b];

        assert_eq!(resolve_instance_id("6f1", &known).unwrap(), a);
        assert_eq!(resolve_instance_id("6F2D", &known).unwrap(), b);
        assert!(resolve_instance_id("6f", &known).is_err());
        assert!(resolve_instance_id("ff", &known).is_err());
        assert_eq!(resolve_instance_id(&a.to_string(), &known).unwrap(), a);
    }
}
