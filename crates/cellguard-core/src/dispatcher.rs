use crate::BoxFuture;
use crate::error::ChannelError;
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcMethod, codes};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

/// What a handler produced: a result value, or a complete response sent as-is
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    Value(Value),
    Response(JsonRpcResponse),
}

pub type MethodHandler =
    Arc<dyn Fn(JsonRpcRequest) -> BoxFuture<'static, anyhow::Result<HandlerOutput>> + Send + Sync>;

/// Routes requests to handlers by method name and turns every outcome into a response.
///
/// Method names match case-insensitively. A missing method yields `-32601`; a handler
/// failure yields `-32603` carrying the error message, with the full error chain as data.
#[derive(Default, Clone)]
pub struct MessageDispatcher {
    methods: HashMap<String, MethodHandler>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an untyped handler working on the raw request
    pub fn register_method<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), ChannelError>
    where
        F: Fn(JsonRpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HandlerOutput>> + Send + 'static,
    {
        let key = name.to_ascii_lowercase();
        if self.methods.contains_key(&key) {
            return Err(ChannelError::DuplicateMethod(name.to_string()));
        }
        let handler: MethodHandler = Arc::new(
            move |request| -> BoxFuture<'static, anyhow::Result<HandlerOutput>> {
                Box::pin(handler(request))
            },
        );
        self.methods.insert(key, handler);
        Ok(())
    }

    /// Register a typed handler for `M`; malformed params are answered with `-32602`
    pub fn register<M, F, Fut>(&mut self, handler: F) -> Result<(), ChannelError>
    where
        M: RpcMethod,
        F: Fn(M::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Output>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_method(M::NAME, move |request: JsonRpcRequest| {
            let handler = handler.clone();
            async move {
                let params = match request.parse_params::<M::Params>() {
                    Ok(params) => params,
                    Err(e) => {
                        return Ok(HandlerOutput::Response(JsonRpcResponse::failure(
                            request.id,
                            JsonRpcError::new(
                                codes::INVALID_PARAMS,
                                format!("Invalid params for '{}': {e}", M::NAME),
                            ),
                        )));
                    }
                };
                let output = handler(params).await?;
                Ok(HandlerOutput::Value(serde_json::to_value(output)?))
            }
        })
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(&name.to_ascii_lowercase())
    }

    /// Run the handler for `request` and build its response
    pub async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let Some(handler) = self.methods.get(&request.method.to_ascii_lowercase()).cloned() else {
            debug!(method = %request.method, "Unknown method");
            return JsonRpcResponse::failure(
                id,
                JsonRpcError::new(
                    codes::METHOD_NOT_FOUND,
                    format!("The method '{}' does not exist.", request.method),
                ),
            );
        };

        let method = request.method.clone();
        match handler(request).await {
            Ok(HandlerOutput::Value(value)) => JsonRpcResponse::success(id, value),
            Ok(HandlerOutput::Response(response)) => response,
            Err(e) => {
                error!(method = %method, "Handler failed: {e:#}");
                JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(codes::INTERNAL_ERROR, e.to_string())
                        .with_data(Value::String(format!("{e:?}"))),
                )
            }
        }
    }
}
