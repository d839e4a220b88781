//! Ordered fallback across interchangeable backends.

use std::future::Future;

/// Every candidate failed. Failures are kept in the order they happened.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub failures: Vec<(String, E)>,
}

/// Try `candidates` in priority order and return the first success.
///
/// Later candidates are only attempted after the previous one failed. When
/// all of them fail, every failure is returned together with the name the
/// `name` closure gives its candidate. An empty candidate list is exhausted
/// immediately.
pub async fn try_in_order<C, T, E, N, F, Fut>(
    candidates: &[C],
    name: N,
    mut attempt: F,
) -> Result<T, Exhausted<E>>
where
    N: Fn(&C) -> String,
    F: FnMut(&C) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        match attempt(candidate).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let candidate_name = name(candidate);
                tracing::warn!(candidate = %candidate_name, attempt = index + 1, error = %e, "Candidate failed, trying next");
                failures.push((candidate_name, e));
            }
        }
    }
    Err(Exhausted { failures })
}
