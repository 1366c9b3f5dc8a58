/// Nickname selection on collisions: configured alternates first, then the
/// primary nickname with a growing run of underscores.
#[derive(Debug, Clone)]
pub struct NickPolicy {
    primary: String,
    alternates: Vec<String>,
    alt_index: Option<usize>,
    underscores: usize,
}

impl NickPolicy {
    pub fn new(primary: impl Into<String>, alternates: Vec<String>) -> Self {
        Self {
            primary: primary.into(),
            alternates,
            alt_index: None,
            underscores: 0,
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn is_primary(&self, nick: &str) -> bool {
        self.primary.eq_ignore_ascii_case(nick)
    }

    pub fn reset(&mut self) {
        self.alt_index = None;
        self.underscores = 0;
    }

    pub fn is_reset(&self) -> bool {
        self.alt_index.is_none() && self.underscores == 0
    }

    /// The nickname to try after the current one was rejected.
    pub fn next_after_collision(&mut self) -> String {
        let next_alt = self.alt_index.map_or(0, |i| i + 1);
        if self.underscores == 0 && next_alt < self.alternates.len() {
            self.alt_index = Some(next_alt);
            return self.alternates[next_alt].clone();
        }
        self.alt_index = Some(self.alternates.len());
        self.underscores += 1;
        format!("{}{}", self.primary, "_".repeat(self.underscores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternates_then_underscores() {
        for n in 0..4 {
            let alternates: Vec<String> = (0..n).map(|i| format!("alt{i}")).collect();
            let mut policy = NickPolicy::new("kestrel", alternates.clone());
            for alt in &alternates {
                assert_eq!(&policy.next_after_collision(), alt);
            }
            assert_eq!(policy.next_after_collision(), "kestrel_", "with {n} alternates");
            assert_eq!(policy.next_after_collision(), "kestrel__");
            assert_eq!(policy.next_after_collision(), "kestrel___");
        }
    }

    #[test]
    fn test_reset_starts_over() {
        let mut policy = NickPolicy::new("kestrel", vec!["kes".to_string()]);
        policy.next_after_collision();
        policy.next_after_collision();
        assert!(!policy.is_reset());
        policy.reset();
        assert!(policy.is_reset());
        assert_eq!(policy.next_after_collision(), "kes");
        assert!(policy.is_primary("KESTREL"));
    }
}
