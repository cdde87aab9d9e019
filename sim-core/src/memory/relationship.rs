use serde::{Deserialize, Serialize};

/// What one sim knows about another.
///
/// Unlike the observation log there is a single consolidated entry per
/// other sim, rewritten as new information arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// How this sim refers to the other one. Starts out as the other sim's
    /// outward description until the sim learns a name.
    pub name: String,
    /// Consolidated knowledge about the other sim.
    pub text: String,
}

impl Relationship {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Raw concatenation of the current text and new information.
    pub fn appended(&self, delta: &str) -> String {
        match (self.text.trim().is_empty(), delta.trim().is_empty()) {
            (true, _) => delta.trim().to_string(),
            (false, true) => self.text.clone(),
            (false, false) => format!("{} {}", self.text.trim_end(), delta.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appended() {
        let rel = Relationship::new("a tall miller", "Sells flour.");
        assert_eq!(rel.appended("Owes me money."), "Sells flour. Owes me money.");
        assert_eq!(rel.appended("  "), "Sells flour.");
        assert_eq!(Relationship::new("x", "").appended("Hello"), "Hello");
    }
}
