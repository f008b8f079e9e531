use serde::{Deserialize, Serialize};

/// Ordered list of bus addresses: the hops a message copy has traversed, or
/// the hops it is planned to take.
///
/// A route is never mutated in place: every forwarded copy gets its own route
/// derived from the one it arrived with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Route(Vec<String>);

impl Route {
    pub fn new() -> Self {
        Route(Vec::new())
    }

    pub fn from_hops<I, S>(hops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Route(hops.into_iter().map(Into::into).collect())
    }

    pub fn hops(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.iter().any(|hop| hop == address)
    }

    pub fn position(&self, address: &str) -> Option<usize> {
        self.0.iter().position(|hop| hop == address)
    }

    /// Copy of this route with `address` appended.
    pub fn with_hop(&self, address: &str) -> Route {
        let mut hops = self.0.clone();
        hops.push(address.to_string());
        Route(hops)
    }

    /// Hop following `address`, if `address` is on the route.
    pub fn next_after(&self, address: &str) -> Option<&str> {
        let index = self.position(address)?;
        self.0.get(index + 1).map(String::as_str)
    }

    /// Reversed route with repeated hops removed, first occurrence kept.
    pub fn reversed_unique(&self) -> Route {
        let mut hops: Vec<String> = Vec::with_capacity(self.0.len());
        for hop in self.0.iter().rev() {
            if !hops.contains(hop) {
                hops.push(hop.clone());
            }
        }
        Route(hops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_hop_leaves_original_untouched() {
        let route = Route::from_hops(["a", "b"]);
        let extended = route.with_hop("c");
        assert_eq!(route.len(), 2);
        assert_eq!(extended.hops(), &["a", "b", "c"]);
        assert!(extended.contains("c"));
        assert!(!route.contains("c"));
    }

    #[test]
    fn test_reversed_unique() {
        let route = Route::from_hops(["a", "b", "a", "c", "d"]);
        assert_eq!(route.reversed_unique().hops(), &["d", "c", "a", "b"]);
    }

    #[test]
    fn test_next_after() {
        let route = Route::from_hops(["a", "b", "c"]);
        assert_eq!(route.next_after("a"), Some("b"));
        assert_eq!(route.next_after("c"), None);
        assert_eq!(route.next_after("x"), None);
    }

    #[test]
    fn test_wire_form_is_plain_array() {
        let route = Route::from_hops(["a", "b"]);
        assert_eq!(serde_json::to_string(&route).unwrap(), r#"["a","b"]"#);
    }
}
