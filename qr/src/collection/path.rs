//! Item path builders
//!
//! Every item has a typed path used in events, filters, and results:
//! `folder:/Users/Admins`, `request:/Users/Get User`, `collection:/`.

/// Join a parent slash-path with a child name
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Typed path for a folder at the given slash-path
pub fn folder(slash_path: &str) -> String {
    format!("folder:{slash_path}")
}

/// Typed path for a request at the given slash-path
pub fn request(slash_path: &str) -> String {
    format!("request:{slash_path}")
}

/// Typed path for the collection itself
pub fn collection() -> String {
    "collection:/".to_string()
}

/// Strip the `folder:`/`request:`/`collection:` prefix from a typed path
pub fn slash_path(typed: &str) -> &str {
    typed.split_once(':').map(|(_, p)| p).unwrap_or(typed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("", "Users"), "/Users");
        assert_eq!(join("/Users", "Get User"), "/Users/Get User");
    }

    #[test]
    fn test_typed_paths() {
        assert_eq!(folder("/A/B"), "folder:/A/B");
        assert_eq!(request("/A/Get"), "request:/A/Get");
        assert_eq!(collection(), "collection:/");
    }

    #[test]
    fn test_slash_path() {
        assert_eq!(slash_path("request:/A/Get"), "/A/Get");
        assert_eq!(slash_path("collection:/"), "/");
        assert_eq!(slash_path("/bare"), "/bare");
    }
}
