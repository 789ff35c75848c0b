use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project_lite::pin_project;
use serde_json::Value;
use toolloop_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
    ToolCallRequest,
};

use crate::Error;
use crate::io::{Sse, SseError};
use crate::proto::{ChatCompletionChunk, ToolCall};

struct PartialState {
    sse: Sse,
    id: Option<String>,
    tool_calls: Vec<ToolCall>,
    // Tool calls are only handed out once the stream has finished, since
    // their arguments arrive in fragments.
    pending_tool_calls: VecDeque<usize>,
    // This field will be cleared after the response returns the complete event.
    pending_finish_reason: Option<ModelFinishReason>,
    finished: bool,
}

impl PartialState {
    fn finish(&mut self, reason: Option<ModelFinishReason>) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Keep the emitted order, which is the order of `index` for servers
        // that send it.
        self.tool_calls.sort_by_key(|t| t.index);
        self.pending_tool_calls = (0..self.tool_calls.len()).collect();
        self.pending_finish_reason = Some(reason.unwrap_or(
            if self.tool_calls.is_empty() {
                ModelFinishReason::Stop
            } else {
                ModelFinishReason::ToolCalls
            },
        ));
    }

    fn merge_tool_call(&mut self, tool_call: ToolCall) {
        let partial_tool_call = match tool_call.index {
            Some(index) => self
                .tool_calls
                .iter_mut()
                .find(|t| t.index == Some(index)),
            // Without an index, a fragment continues the last call unless it
            // opens a new one with its own id.
            None => self.tool_calls.last_mut().filter(|t| {
                t.index.is_none() && (tool_call.id.is_none() || t.id.is_none())
            }),
        };
        let Some(partial_tool_call) = partial_tool_call else {
            self.tool_calls.push(tool_call);
            return;
        };
        // Patch the partial tool call.
        if let Some(id) = tool_call.id {
            partial_tool_call.id.get_or_insert_default().push_str(&id);
        }
        if let Some(ty) = tool_call.r#type {
            partial_tool_call.r#type.get_or_insert_default().push_str(&ty);
        }
        if let Some(function) = tool_call.function {
            match partial_tool_call.function {
                Some(ref mut partial_func) => {
                    if let Some(name) = function.name {
                        partial_func
                            .name
                            .get_or_insert_default()
                            .push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        partial_func
                            .arguments
                            .get_or_insert_default()
                            .push_str(&arguments);
                    }
                }
                None => partial_tool_call.function = Some(function),
            }
        }
    }

    fn make_tool_call_request(&self, idx: usize) -> ToolCallRequest {
        let tool_call = &self.tool_calls[idx];
        let id = tool_call
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{idx}"));
        let function = tool_call.function.as_ref();
        let name = function
            .and_then(|f| f.name.clone())
            .unwrap_or_default();
        let arguments = match function.and_then(|f| f.arguments.as_deref()) {
            None => Value::Object(Default::default()),
            Some(args) if args.trim().is_empty() => {
                Value::Object(Default::default())
            }
            // Broken arguments are passed through as a string, the tool
            // validation will report it back to the model.
            Some(args) => serde_json::from_str::<Value>(args)
                .unwrap_or_else(|_| Value::String(args.to_owned())),
        };
        ToolCallRequest {
            id,
            name,
            arguments,
        }
    }
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    pub struct OpenAIResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
    }
}

impl OpenAIResponse {
    #[inline]
    pub fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            id: None,
            tool_calls: Default::default(),
            pending_tool_calls: Default::default(),
            pending_finish_reason: Default::default(),
            finished: false,
        };
        let next_event_fut = async move { next_event(partial_state).await };
        Self {
            next_event_fut: Some(Box::pin(next_event_fut)),
        }
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        // The stream may still have more data to pull, create a new future for
        // the next event.
        let next_event_fut = async move { next_event(partial_state).await };
        *this.next_event_fut = Some(Box::pin(next_event_fut));

        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(
    mut partial_state: PartialState,
) -> Result<(Option<ModelResponseEvent>, PartialState), Error> {
    loop {
        // The order of events are important. Message deltas are returned
        // as soon as they arrive, then the pending tool calls, and finally
        // the finish reason.
        if let Some(idx) = partial_state.pending_tool_calls.pop_front() {
            let req = partial_state.make_tool_call_request(idx);
            return Ok((Some(ModelResponseEvent::ToolCall(req)), partial_state));
        }
        if let Some(reason) = partial_state.pending_finish_reason.take() {
            return Ok((
                Some(ModelResponseEvent::Completed(reason)),
                partial_state,
            ));
        }
        if partial_state.finished {
            return Ok((None, partial_state));
        }

        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                partial_state.finish(None);
                continue;
            }
            Err(SseError::ChunksError(err)) => {
                let kind = if err.timeout {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Network
                };
                return Err(Error::new(err.message, kind));
            }
            Err(err) => {
                return Err(Error::new(
                    format!("{err:?}"),
                    ErrorKind::MalformedResponse,
                ));
            }
        };
        trace!("got sse event: {sse_event}");
        if sse_event == "[DONE]" {
            partial_state.finish(None);
            continue;
        }

        let mut chunk = serde_json::from_str::<ChatCompletionChunk>(&sse_event)
            .map_err(|err| {
                Error::new(format!("{err}"), ErrorKind::MalformedResponse)
            })?;
        if partial_state.id.get_or_insert_with(|| chunk.id.clone()) != &chunk.id
        {
            return Err(Error::new(
                "chunk id mismatch",
                ErrorKind::MalformedResponse,
            ));
        };

        // Usage reports come with an empty choice list.
        let Some(choice) = chunk.choices.pop() else {
            continue;
        };

        if let Some(tool_calls) = choice.delta.tool_calls {
            for tool_call in tool_calls {
                partial_state.merge_tool_call(tool_call);
            }
        }

        if let Some(finish_reason) = choice.finish_reason {
            let finish_reason = if finish_reason == "tool_calls" {
                ModelFinishReason::ToolCalls
            } else {
                ModelFinishReason::Stop
            };
            partial_state.finish(Some(finish_reason));
        }

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                return Ok((
                    Some(ModelResponseEvent::MessageDelta(content)),
                    partial_state,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use bytes::Bytes;
    use serde_json::json;
    use toolloop_model::ModelProviderError;

    use super::*;
    use crate::Chunks;

    async fn collect_events(fixture: &'static [u8]) -> Vec<ModelResponseEvent> {
        let chunks =
            Chunks::from_vec_deque(vec![Bytes::from_static(fixture)].into());
        let sse = Sse::new(chunks);
        let mut resp = pin!(OpenAIResponse::from_sse(sse));
        let mut events = vec![];
        while let Some(event) =
            poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await.unwrap()
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_tool_call_events() {
        let events =
            collect_events(include_bytes!("../fixtures/tool_calls.txt")).await;
        assert_eq!(
            events,
            vec![
                ModelResponseEvent::MessageDelta("Let me ".to_owned()),
                ModelResponseEvent::MessageDelta("compute.".to_owned()),
                ModelResponseEvent::ToolCall(ToolCallRequest {
                    id: "call_add".to_owned(),
                    name: "add".to_owned(),
                    arguments: json!({ "a": 4, "b": 7 }),
                }),
                ModelResponseEvent::ToolCall(ToolCallRequest {
                    id: "call_mul".to_owned(),
                    name: "multiply".to_owned(),
                    arguments: json!({ "a": 1, "b": 2 }),
                }),
                ModelResponseEvent::Completed(ModelFinishReason::ToolCalls),
            ]
        );
    }

    #[tokio::test]
    async fn test_tool_call_fragments_without_index() {
        let events = collect_events(include_bytes!(
            "../fixtures/tool_calls_without_index.txt"
        ))
        .await;
        assert_eq!(
            events,
            vec![
                ModelResponseEvent::ToolCall(ToolCallRequest {
                    id: "call_add".to_owned(),
                    name: "add".to_owned(),
                    arguments: json!({ "a": 4, "b": 7 }),
                }),
                ModelResponseEvent::ToolCall(ToolCallRequest {
                    id: "call_mul".to_owned(),
                    name: "multiply".to_owned(),
                    arguments: json!({ "a": 1, "b": 2 }),
                }),
                ModelResponseEvent::Completed(ModelFinishReason::ToolCalls),
            ]
        );
    }

    #[tokio::test]
    async fn test_text_events() {
        let events =
            collect_events(include_bytes!("../fixtures/text.txt")).await;
        assert_eq!(
            events,
            vec![
                ModelResponseEvent::MessageDelta("The answer ".to_owned()),
                ModelResponseEvent::MessageDelta("is 2.".to_owned()),
                ModelResponseEvent::Completed(ModelFinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let events = collect_events(
            b"data: {\"id\":\"c\",\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
        )
        .await;
        assert_eq!(
            events,
            vec![
                ModelResponseEvent::MessageDelta("Hi".to_owned()),
                ModelResponseEvent::Completed(ModelFinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_chunk() {
        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"data: {not json}\n\n")].into(),
        );
        let mut resp = pin!(OpenAIResponse::from_sse(Sse::new(chunks)));
        let err = poll_fn(|cx| resp.as_mut().poll_next_event(cx))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }
}
