use super::Policy;

/// Iterates the dataset in registration order, once.  No learning, no cycle
/// guard: every prompt is visited exactly one time.
pub struct NaivePolicy {
    prompts: Vec<String>,
    next_idx: usize,
}

impl NaivePolicy {
    pub fn new(prompts: Vec<String>) -> Self {
        Self {
            prompts,
            next_idx: 0,
        }
    }
}

#[async_trait::async_trait]
impl Policy for NaivePolicy {
    fn name(&self) -> &str {
        "naive"
    }

    async fn next(&mut self, _current: Option<&str>, _passed_guard: bool) -> Option<String> {
        let prompt = self.prompts.get(self.next_idx).cloned();
        if prompt.is_some() {
            self.next_idx += 1;
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn visits_in_order_then_runs_dry() {
        let mut p = NaivePolicy::new(vec!["a".into(), "b".into()]);
        assert_eq!(p.next(None, true).await.as_deref(), Some("a"));
        assert_eq!(p.next(Some("a"), true).await.as_deref(), Some("b"));
        assert_eq!(p.next(Some("b"), false).await, None);
    }
}
