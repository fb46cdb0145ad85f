use std::future::Future;
use std::panic;

use tokio::task::JoinHandle;

use crate::context::SpanContext;
use crate::errors::{ErrorRecord, ErrorSeverity};
use crate::tracer::Tracer;

/// Spawns `task` under a child span of `parent`.
///
/// The child's context is passed to `task` as its argument. An `Err` result
/// is recorded on the span; a panic is recorded as critical and then resumed.
pub fn spawn_traced<F, Fut, T, E>(
    tracer: &Tracer,
    parent: &SpanContext,
    operation: impl Into<String>,
    task: F,
) -> JoinHandle<Result<T, E>>
where
    F: FnOnce(SpanContext) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let mut span = tracer.start_child(operation, parent);
    let work = tokio::spawn(task(span.context()));

    tokio::spawn(async move {
        match work.await {
            Ok(result) => {
                if let Err(err) = &result {
                    span.record(ErrorRecord::capture(err));
                }
                span.finish();
                result
            }
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                let message = panic_message(payload.as_ref());
                span.record(
                    ErrorRecord::new(format!("panic: {message}"), "panic")
                        .with_severity(ErrorSeverity::Critical),
                );
                span.finish();
                panic::resume_unwind(payload)
            }
            Err(join_err) => {
                span.record(ErrorRecord::new(join_err.to_string(), "cancelled"));
                span.finish();
                panic::resume_unwind(Box::new(join_err.to_string()))
            }
        }
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Failed;

    impl std::fmt::Display for Failed {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "failed")
        }
    }

    impl std::error::Error for Failed {}

    #[tokio::test]
    async fn task_receives_child_context() {
        let tracer = Tracer::builder("worker").build();
        let parent = tracer.start_span("parent").context().with_baggage("job", "42");

        let expected_trace = parent.trace_id.clone();
        let parent_span = parent.span_id.clone();
        let ctx = spawn_traced(&tracer, &parent, "child", |ctx| async move {
            Ok::<_, Failed>(ctx)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(ctx.trace_id, expected_trace);
        assert_ne!(ctx.span_id, parent_span);
        assert_eq!(ctx.baggage("job"), Some("42"));
    }

    #[tokio::test]
    async fn errors_are_returned_to_the_caller() {
        let tracer = Tracer::builder("worker").build();
        let parent = tracer.start_span("parent").context();
        let result = spawn_traced(&tracer, &parent, "child", |_| async { Err::<(), _>(Failed) })
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn panics_propagate_through_join_handle() {
        let tracer = Tracer::builder("worker").build();
        let parent = tracer.start_span("parent").context();
        let joined = spawn_traced(&tracer, &parent, "child", |_| async {
            if true {
                panic!("boom");
            }
            Ok::<(), Failed>(())
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
    }

    #[test]
    fn panic_message_downcasts() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&5u8), "unknown panic");
    }
}
