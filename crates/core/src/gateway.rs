use std::fmt::{self, Debug, Display};
use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Arc;

use toolloop_model::{
    ModelFinishReason, ModelMessage, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent, ModelTool,
    ToolCallRequest,
};
use tracing::Instrument;

use crate::conversation::{Conversation, ToolCall};

type BoxedProviderError = Box<dyn ModelProviderError>;
type SendRequestResult = Result<ModelClientResponse, BoxedProviderError>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = SendRequestResult> + Send>>;
type DeltaFn = Arc<dyn Fn(&str) + Send + Sync>;
#[rustfmt::skip]
type HandlerFn = Arc<
    dyn Fn(ModelRequest, Option<DeltaFn>) -> BoxedSendRequestFuture
        + Send + Sync
>;

/// What the model decided to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentDecision {
    /// The model answered without requesting any tool.
    Final(String),
    /// The model requested tools, possibly along with some text.
    Invoke {
        /// Text produced before the tool calls, may be empty.
        text: String,
        /// Requested calls, in emitted order.
        calls: Vec<ToolCall>,
    },
}

/// A failed gateway request.
pub enum GatewayError {
    /// The request may succeed if sent again later.
    Transient(BoxedProviderError),
    /// Retrying will not help.
    Fatal(BoxedProviderError),
}

impl GatewayError {
    fn classify(err: BoxedProviderError) -> Self {
        if err.kind().is_transient() {
            GatewayError::Transient(err)
        } else {
            GatewayError::Fatal(err)
        }
    }

    /// Returns `true` if this is a transient failure.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    /// Returns the underlying provider error.
    #[inline]
    pub fn provider_error(&self) -> &dyn ModelProviderError {
        match self {
            GatewayError::Transient(err) | GatewayError::Fatal(err) => {
                err.as_ref()
            }
        }
    }
}

impl Debug for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, err) = match self {
            GatewayError::Transient(err) => ("Transient", err),
            GatewayError::Fatal(err) => ("Fatal", err),
        };
        f.debug_tuple(name).field(err).finish()
    }
}

impl Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let err = self.provider_error();
        write!(f, "{err} ({})", err.kind())
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.provider_error())
    }
}

/// A wrapper around a model provider that turns a conversation into a
/// decision.
///
/// The provider type is erased, so the rest of the crate never needs a
/// generic parameter for it. The gateway holds no per-conversation state,
/// and clones share the same provider.
#[derive(Clone)]
pub struct Gateway {
    handler_fn: HandlerFn,
    system_prompt: Option<String>,
    on_delta: Option<DeltaFn>,
}

impl Gateway {
    /// Creates a gateway over the given provider.
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        let handler_fn: HandlerFn = Arc::new(move |req, on_delta| {
            let fut = provider.send_request(&req);
            Box::pin(
                async move {
                    trace!("got a request: {:?}", req);
                    let resp_or_err = fut.await;
                    handle_response::<P>(resp_or_err, on_delta).await
                }
                .instrument(trace_span!("model request")),
            )
        });
        Self {
            handler_fn,
            system_prompt: None,
            on_delta: None,
        }
    }

    /// Sets the system prompt sent ahead of every conversation.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets a callback that receives streamed text as it arrives.
    #[inline]
    pub fn on_delta(
        mut self,
        on_delta: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.on_delta = Some(Arc::new(on_delta));
        self
    }

    /// Returns the configured system prompt.
    #[inline]
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Asks the model what to do next.
    ///
    /// Exactly one provider request is made per call, and the conversation
    /// is never modified.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when this operation is cancelled.
    pub async fn decide(
        &self,
        conversation: &Conversation,
        tools: &[ModelTool],
    ) -> Result<AgentDecision, GatewayError> {
        let req = self.build_request(conversation, tools);
        let resp = (self.handler_fn)(req, self.on_delta.clone())
            .await
            .map_err(GatewayError::classify)?;

        if resp.tool_calls.is_empty() {
            if resp.finish_reason == Some(ModelFinishReason::ToolCalls) {
                warn!("model finished for tool calls but requested none");
            }
            return Ok(AgentDecision::Final(resp.text));
        }
        Ok(AgentDecision::Invoke {
            text: resp.text,
            calls: resp.tool_calls.into_iter().map(Into::into).collect(),
        })
    }

    fn build_request(
        &self,
        conversation: &Conversation,
        tools: &[ModelTool],
    ) -> ModelRequest {
        let system = self
            .system_prompt
            .iter()
            .map(|prompt| ModelMessage::System(prompt.clone()));
        let turns = conversation.turns().iter().map(|t| t.to_model_message());
        ModelRequest {
            messages: system.chain(turns).collect(),
            tools: tools.to_vec(),
        }
    }
}

/// A completely received response.
#[derive(Clone, Debug, Default)]
struct ModelClientResponse {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    finish_reason: Option<ModelFinishReason>,
}

async fn handle_response<P: ModelProvider + 'static>(
    resp_or_err: Result<P::Response, P::Error>,
    on_delta: Option<DeltaFn>,
) -> SendRequestResult {
    let resp = match resp_or_err {
        Ok(resp) => resp,
        Err(err) => {
            debug!("request failed: {err}");
            return Err(Box::new(err));
        }
    };

    let mut result = ModelClientResponse::default();

    trace!("start receiving events");

    let mut pinned_resp = pin!(resp);
    loop {
        let event_or_err =
            poll_fn(|cx| pinned_resp.as_mut().poll_next_event(cx)).await;
        let event = match event_or_err {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err) => {
                debug!("response failed: {err}");
                return Err(Box::new(err));
            }
        };
        trace!("got an event: {event:?}");

        match event {
            ModelResponseEvent::MessageDelta(delta) => {
                if let Some(on_delta) = &on_delta {
                    on_delta(&delta);
                }
                result.text.push_str(&delta);
            }
            ModelResponseEvent::ToolCall(req) => {
                result.tool_calls.push(req);
            }
            ModelResponseEvent::Completed(reason) => {
                result.finish_reason = Some(reason);
            }
        }
    }

    trace!("finished a request");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use toolloop_model::ErrorKind;
    use toolloop_test_model::{
        PresetEvent, PresetResponse, TestModelProvider,
    };

    use super::*;
    use crate::conversation::Turn;

    fn conversation() -> Conversation {
        Conversation::from_turns([Turn::user("Hi")]).unwrap()
    }

    #[tokio::test]
    async fn test_final_decision() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::MessageDelta("How ".to_owned()),
            PresetEvent::MessageDelta("are ".to_owned()),
            PresetEvent::MessageDelta("you?".to_owned()),
        ]));

        let deltas = Arc::new(Mutex::new(vec![]));
        let gateway = Gateway::new(provider.clone())
            .with_system_prompt("Be brief.")
            .on_delta({
                let deltas = Arc::clone(&deltas);
                move |delta| deltas.lock().unwrap().push(delta.to_owned())
            });

        let conversation = conversation();
        let decision = gateway.decide(&conversation, &[]).await.unwrap();
        assert_eq!(decision, AgentDecision::Final("How are you?".to_owned()));
        assert_eq!(*deltas.lock().unwrap(), ["How ", "are ", "you?"]);
        assert_eq!(conversation.len(), 1);

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].messages,
            [
                ModelMessage::System("Be brief.".to_owned()),
                ModelMessage::User("Hi".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_invoke_decision() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(PresetResponse::with_events([
            PresetEvent::MessageDelta("Let me check.".to_owned()),
            PresetEvent::tool_call("c1", "add", json!({ "a": 1, "b": 2 })),
            PresetEvent::tool_call("c2", "multiply", json!({ "a": 3, "b": 4 })),
        ]));
        let gateway = Gateway::new(provider);

        let decision = gateway.decide(&conversation(), &[]).await.unwrap();
        let AgentDecision::Invoke { text, calls } = decision else {
            panic!("expected an invoke decision");
        };
        assert_eq!(text, "Let me check.");
        let names: Vec<_> = calls.iter().map(|c| c.tool_name.as_str()).collect();
        assert_eq!(names, ["add", "multiply"]);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[1].arguments, json!({ "a": 3, "b": 4 }));
    }

    #[tokio::test]
    async fn test_error_classification() {
        let mut provider = TestModelProvider::default();
        provider.add_assistant_response_step(
            PresetResponse::with_text("ok").with_failures(1),
        );
        provider.add_assistant_response_step(
            PresetResponse::with_text("never")
                .with_failures(0)
                .with_failure_kind(ErrorKind::Unauthorized),
        );
        let gateway = Gateway::new(provider);
        let conversation = conversation();

        let err = gateway.decide(&conversation, &[]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.provider_error().kind(), ErrorKind::RateLimitExceeded);

        let decision = gateway.decide(&conversation, &[]).await.unwrap();
        assert_eq!(decision, AgentDecision::Final("ok".to_owned()));

        let err = gateway.decide(&conversation, &[]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Fatal(_)));
        assert_eq!(err.provider_error().kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_no_steps_is_fatal() {
        let gateway = Gateway::new(TestModelProvider::default());
        let err = gateway.decide(&conversation(), &[]).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
