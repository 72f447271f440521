//! 工具协议服务：stdio 上的换行分隔 JSON-RPC 2.0
//!
//! 支持 `initialize`、`ping`、`tools/list`、`tools/call`。每次人格切换成功后
//! 推送 `notifications/tools/list_changed`，客户端据此刷新工具列表。
//! 所有输出经同一个写任务串行写出；`tools/call` 各自在独立任务中执行，长时间运行的技能不阻塞其他请求。

pub mod protocol;

use std::io;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::runtime::Runtime;
use crate::persona::CapabilityEvent;
use crate::tools::executor::InvokeError;
use protocol::*;

#[derive(Clone)]
pub struct ToolServer {
    runtime: Arc<Runtime>,
}

fn send(tx: &mpsc::UnboundedSender<String>, message: &impl Serialize) {
    match serde_json::to_string(message) {
        Ok(line) => {
            // 写任务已退出（输出端关闭）时丢弃
            let _ = tx.send(line);
        }
        Err(e) => tracing::error!("failed to encode message: {}", e),
    }
}

impl ToolServer {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// 在 stdin / stdout 上服务直到 EOF 或取消
    pub async fn serve_stdio(&self, shutdown: CancellationToken) -> io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout(), shutdown).await
    }

    pub async fn serve<R, W>(&self, reader: R, mut writer: W, shutdown: CancellationToken) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<_, io::Error>(())
        });

        let forwarder = {
            let mut events = self.runtime.personas().subscribe();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(CapabilityEvent::ToolsChanged { persona, tools }) => {
                            tracing::debug!(persona = %persona, tools = tools.len(), "notifying client of tool change");
                            send(&tx, &JsonRpcNotification::new(NOTIFICATION_TOOLS_CHANGED, None));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            send(&tx, &JsonRpcNotification::new(NOTIFICATION_TOOLS_CHANGED, None));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        tracing::info!("tool server listening on stdio");
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("invalid JSON-RPC message: {}", e);
                    let err = JsonRpcError::new(JsonRpcError::PARSE_ERROR, format!("Parse error: {}", e));
                    send(&tx, &JsonRpcResponse::failure(Value::Null, err));
                    continue;
                }
            };

            if request.method == METHOD_TOOLS_CALL && !request.is_notification() {
                let server = self.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(resp) = server.handle(request).await {
                        send(&tx, &resp);
                    }
                });
            } else if let Some(resp) = self.handle(request).await {
                send(&tx, &resp);
            }
        }

        forwarder.abort();
        drop(tx);
        tracing::info!("tool server stopped");
        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }

    /// 处理一条请求；通知返回 None
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let Some(id) = request.id.clone() else {
            tracing::debug!(method = %request.method, "notification received");
            return None;
        };
        if request.jsonrpc != JSONRPC_VERSION {
            let err = JsonRpcError::new(JsonRpcError::INVALID_REQUEST, "jsonrpc must be \"2.0\"");
            return Some(JsonRpcResponse::failure(id, err));
        }

        let result = match request.method.as_str() {
            METHOD_INITIALIZE => Ok(self.initialize()),
            METHOD_PING => Ok(json!({})),
            METHOD_TOOLS_LIST => Ok(json!({ "tools": self.runtime.registry().descriptors().await })),
            METHOD_TOOLS_CALL => self.call_tool(request.params).await,
            other => Err(JsonRpcError::new(
                JsonRpcError::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            )),
        };
        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(err) => JsonRpcResponse::failure(id, err),
        })
    }

    fn initialize(&self) -> Value {
        let name = self.runtime.config().app.name.clone().unwrap_or_else(|| "hive".to_string());
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": { "name": name, "version": env!("CARGO_PKG_VERSION") },
        })
    }

    /// 工具失败（含未找到）以 isError 结果返回，不作为协议错误
    async fn call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CallToolParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("Invalid params: {}", e)))?;
        let args = params.arguments.unwrap_or_else(|| json!({}));

        let result = match self.runtime.executor().execute(&params.name, args).await {
            Ok(text) => CallToolResult::text(text, false),
            Err(e @ InvokeError::NotFound(_)) => CallToolResult::text(e.to_string(), true),
            Err(InvokeError::Failed(text)) => CallToolResult::text(text, true),
        };
        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::new(JsonRpcError::INVALID_PARAMS, e.to_string()))
    }
}
