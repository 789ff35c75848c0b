use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::task::{self, Poll, ready};
use std::time::Duration;

use serde_json::json;
use tokio::time::{Sleep, sleep};
use toolloop_model::{
    ErrorKind, ModelFinishReason, ModelMessage, ModelProvider,
    ModelProviderError, ModelRequest, ModelResponse, ModelResponseEvent,
    ToolCallRequest,
};

#[derive(Debug)]
struct FakeModelProviderError(ErrorKind);

impl Display for FakeModelProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Error for FakeModelProviderError {}

impl ModelProviderError for FakeModelProviderError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

#[derive(Debug)]
struct FakeModelResponse {
    fake_items: VecDeque<ModelResponseEvent>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl FakeModelResponse {
    /// Echoes the input word by word, or asks for the `echo` tool when the
    /// input starts with a slash.
    fn new(input: &str) -> Self {
        let mut fake_items: VecDeque<_> = if let Some(rest) =
            input.strip_prefix('/')
        {
            VecDeque::from([ModelResponseEvent::ToolCall(ToolCallRequest {
                id: "call:0".to_owned(),
                name: "echo".to_owned(),
                arguments: json!({ "text": rest }),
            })])
        } else {
            let words: Vec<_> = format!("You said {input}")
                .split(' ')
                .map(ToString::to_string)
                .collect();
            let count = words.len();
            words
                .into_iter()
                .enumerate()
                .map(|(idx, mut word)| {
                    if idx + 1 < count {
                        word.push(' ');
                    }
                    ModelResponseEvent::MessageDelta(word)
                })
                .collect()
        };
        let reason = if input.starts_with('/') {
            ModelFinishReason::ToolCalls
        } else {
            ModelFinishReason::Stop
        };
        fake_items.push_back(ModelResponseEvent::Completed(reason));
        Self {
            fake_items,
            sleep: None,
        }
    }
}

impl ModelResponse for FakeModelResponse {
    type Error = FakeModelProviderError;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        if let Some(sleep) = &mut this.sleep {
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;
            return Poll::Ready(Ok(this.fake_items.pop_front()));
        }
        this.sleep = Some(Box::pin(sleep(Duration::from_millis(1))));
        Pin::new(this).poll_next_event(cx)
    }
}

struct FakeModelProvider;

impl ModelProvider for FakeModelProvider {
    type Error = FakeModelProviderError;
    type Response = FakeModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let result = 'blk: {
            let Some(last) = req.messages.last() else {
                break 'blk Err(FakeModelProviderError(
                    ErrorKind::InvalidRequest,
                ));
            };

            let content = match last {
                ModelMessage::User(text) => text.as_str(),
                _ => unreachable!("unexpected message: {last:?}"),
            };

            Ok(FakeModelResponse::new(content))
        };
        ready(result)
    }
}

async fn collect_events(
    mut resp: FakeModelResponse,
) -> Vec<ModelResponseEvent> {
    let mut events = vec![];
    while let Some(event) =
        std::future::poll_fn(|cx| Pin::new(&mut resp).poll_next_event(cx))
            .await
            .unwrap()
    {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_completion() {
    let provider = FakeModelProvider;
    let req = ModelRequest {
        messages: vec![ModelMessage::User("Good morning".to_string())],
        tools: vec![],
    };
    let resp = provider.send_request(&req).await.unwrap();

    let mut resp_message = String::new();
    for event in collect_events(resp).await {
        match event {
            ModelResponseEvent::MessageDelta(delta) => {
                resp_message.push_str(&delta);
            }
            ModelResponseEvent::Completed(reason) => {
                assert_eq!(reason, ModelFinishReason::Stop);
            }
            _ => unreachable!("unexpected event: {event:?}"),
        }
    }

    assert_eq!(resp_message, "You said Good morning");
}

#[tokio::test]
async fn test_tool_call() {
    let provider = FakeModelProvider;
    let req = ModelRequest {
        messages: vec![ModelMessage::User("/ping".to_string())],
        tools: vec![],
    };
    let resp = provider.send_request(&req).await.unwrap();
    let events = collect_events(resp).await;
    assert_eq!(events.len(), 2);
    let ModelResponseEvent::ToolCall(call) = &events[0] else {
        panic!("expected a tool call, got {:?}", events[0]);
    };
    assert_eq!(call.name, "echo");
    assert_eq!(call.arguments, json!({ "text": "ping" }));
    assert_eq!(
        events[1],
        ModelResponseEvent::Completed(ModelFinishReason::ToolCalls)
    );
}

#[tokio::test]
async fn test_error() {
    let provider = FakeModelProvider;
    let req = ModelRequest {
        messages: vec![],
        tools: vec![],
    };
    let result = provider.send_request(&req).await;
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(!err.kind().is_transient());
}
