use std::fmt;

/// Pairs a bolus request with its confirming resend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub requester: String,
    pub nonce: i64,
}

impl RequestKey {
    pub fn new(requester: impl Into<String>, nonce: i64) -> Self {
        Self {
            requester: requester.into(),
            nonce,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.requester, self.nonce)
    }
}

/// The open authorization request, if any. Holds at most one entry: a new
/// request cycle replaces whatever was pending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingConfirmation {
    entry: Option<(RequestKey, f64)>,
}

impl PendingConfirmation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    pub fn len(&self) -> usize {
        usize::from(self.entry.is_some())
    }

    pub fn amount_for(&self, key: &RequestKey) -> Option<f64> {
        match &self.entry {
            Some((pending, units)) if pending == key => Some(*units),
            _ => None,
        }
    }

    pub fn replace(&mut self, key: RequestKey, units: f64) {
        self.entry = Some((key, units));
    }

    /// Removes and returns the amount if `key` is the pending request.
    pub fn take(&mut self, key: &RequestKey) -> Option<f64> {
        let units = self.amount_for(key)?;
        self.entry = None;
        Some(units)
    }

    pub fn entry(&self) -> Option<(&RequestKey, f64)> {
        self.entry.as_ref().map(|(key, units)| (key, *units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacing_discards_the_previous_request() {
        let mut pending = PendingConfirmation::new();
        pending.replace(RequestKey::new("a", 1), 1.0);
        pending.replace(RequestKey::new("b", 2), 2.0);

        assert_eq!(pending.len(), 1);
        assert_eq!(pending.amount_for(&RequestKey::new("a", 1)), None);
        assert_eq!(pending.amount_for(&RequestKey::new("b", 2)), Some(2.0));
    }

    #[test]
    fn take_consumes_only_the_matching_key() {
        let mut pending = PendingConfirmation::new();
        pending.replace(RequestKey::new("a", 1), 1.0);

        assert_eq!(pending.take(&RequestKey::new("a", 2)), None);
        assert!(!pending.is_empty());
        assert_eq!(pending.take(&RequestKey::new("a", 1)), Some(1.0));
        assert!(pending.is_empty());
    }
}
