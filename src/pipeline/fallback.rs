//! Ordered alternatives for one unreliable operation.
//!
//! Used inside stage functions: e.g. extracting an article with a fast
//! parser, then a readability service, then a headless browser.

use crate::error::{BoxError, FallbackError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

type CandidateFn<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

/// One named producer in a fallback chain.
pub struct Candidate<A, T> {
    name: String,
    func: CandidateFn<A, T>,
}

impl<A, T> Clone for Candidate<A, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<A, T> fmt::Debug for Candidate<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate").field("name", &self.name).finish()
    }
}

impl<A: 'static, T: 'static> Candidate<A, T> {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |arg| func(arg).boxed()),
        }
    }

    pub fn sync<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(A) -> Result<T, BoxError> + Send + Sync + 'static,
        A: Send,
        T: Send,
    {
        let func = Arc::new(func);
        Self {
            name: name.into(),
            func: Arc::new(move |arg| {
                let func = Arc::clone(&func);
                async move { func(arg) }.boxed()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Try `candidates` in order and return the first result.
///
/// Errors are logged and the next candidate is tried. When all fail, the
/// error of the last one is returned.
pub async fn one_of<A: Clone, T>(candidates: &[Candidate<A, T>], arg: &A) -> Result<T, FallbackError> {
    one_of_validated(candidates, arg, |_: &T, _: &A| true).await
}

/// Like [`one_of`], but a result `validate` rejects counts as a failure and
/// the chain moves on to the next candidate.
pub async fn one_of_validated<A, T, V>(
    candidates: &[Candidate<A, T>],
    arg: &A,
    validate: V,
) -> Result<T, FallbackError>
where
    A: Clone,
    V: Fn(&T, &A) -> bool,
{
    let mut last = FallbackError::NoCandidates;
    for (index, candidate) in candidates.iter().enumerate() {
        let attempts = index + 1;
        match (candidate.func)(arg.clone()).await {
            Ok(value) if validate(&value, arg) => {
                debug!("'{}' succeeded on attempt {}", candidate.name, attempts);
                return Ok(value);
            }
            Ok(_) => {
                debug!("'{}' result rejected by validation", candidate.name);
                last = FallbackError::Rejected {
                    attempts,
                    candidate: candidate.name.clone(),
                };
            }
            Err(source) => {
                debug!("'{}' failed: {}", candidate.name, source);
                last = FallbackError::Exhausted {
                    attempts,
                    candidate: candidate.name.clone(),
                    source,
                };
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn failing(name: &'static str) -> Candidate<String, String> {
        Candidate::sync(name, move |_| Err(format!("{name} down").into()))
    }

    fn ok(name: &'static str, value: &'static str) -> Candidate<String, String> {
        Candidate::sync(name, move |_| Ok(value.to_string()))
    }

    #[tokio::test]
    async fn first_success_wins() {
        let chain = [failing("a"), failing("b"), ok("c", "text"), ok("d", "never")];
        let out = one_of(&chain, &"url".to_string()).await.unwrap();
        assert_eq!(out, "text");
    }

    #[tokio::test]
    async fn last_error_is_reported() {
        use std::error::Error as _;
        let chain = [failing("a"), failing("b"), failing("c")];
        let err = one_of(&chain, &"url".to_string()).await.unwrap_err();
        match &err {
            FallbackError::Exhausted { attempts, candidate, .. } => {
                assert_eq!(*attempts, 3);
                assert_eq!(candidate, "c");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.source().unwrap().to_string(), "c down");
    }

    #[tokio::test]
    async fn rejected_result_advances_chain() {
        let chain = [ok("fast", ""), ok("slow", "full text")];
        let out = one_of_validated(&chain, &"url".to_string(), |text: &String, _: &String| {
            !text.is_empty()
        })
        .await
        .unwrap();
        assert_eq!(out, "full text");
    }

    #[tokio::test]
    async fn rejection_as_last_failure() {
        let chain = [failing("a"), ok("b", "")];
        let err = one_of_validated(&chain, &"url".to_string(), |t: &String, _: &String| {
            !t.is_empty()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, FallbackError::Rejected { ref candidate, .. } if candidate == "b"));
    }

    #[tokio::test]
    async fn empty_chain() {
        let chain: [Candidate<String, String>; 0] = [];
        let err = one_of(&chain, &String::new()).await.unwrap_err();
        assert!(matches!(err, FallbackError::NoCandidates));
    }

    #[tokio::test]
    async fn candidates_receive_their_own_copy() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let chain = [Candidate::new("async", move |mut arg: Vec<u8>| {
            let s = Arc::clone(&s);
            async move {
                arg.push(9);
                s.lock().unwrap().push(arg.clone());
                Ok::<_, BoxError>(arg.len())
            }
        })];
        let original = vec![1, 2];
        assert_eq!(one_of(&chain, &original).await.unwrap(), 3);
        assert_eq!(original, [1, 2]);
        assert_eq!(seen.lock().unwrap()[0], [1, 2, 9]);
    }
}
