//! Minimal HTTP + WebSocket stand-in for a ComfyUI instance.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Notify;

/// What the push channel does once a client connects.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Text frames sent to every connected client.
    pub frames: Vec<String>,
    /// Hold the frames until a prompt has been submitted.
    pub wait_for_prompt: bool,
    /// Close the socket after the last frame instead of idling.
    pub close_after_frames: bool,
}

#[derive(Default)]
pub struct ServerState {
    calls: Mutex<Vec<String>>,
    pub reject_prompts: AtomicBool,
    prompted: Notify,
    script: Script,
}

impl ServerState {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

pub struct FakeComfyUI {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
}

impl FakeComfyUI {
    pub async fn spawn(script: Script) -> Self {
        let state = Arc::new(ServerState {
            script,
            ..ServerState::default()
        });

        let app = Router::new()
            .route("/prompt", post(submit_prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/object_info/{node_class}", get(object_info))
            .route("/interrupt", post(interrupt))
            .route("/queue", post(queue))
            .route("/system_stats", get(system_stats))
            .route("/ws", get(ws_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn submit_prompt(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Json<Value> {
    let client_id = body["client_id"].as_str().unwrap_or_default();
    state.record(format!("prompt:{client_id}"));

    if state.reject_prompts.load(Ordering::SeqCst) {
        return Json(json!({
            "prompt_id": "p-1",
            "number": 0,
            "node_errors": {"3": {"errors": [{"message": "Value not in list"}]}}
        }));
    }

    state.prompted.notify_one();
    Json(json!({"prompt_id": "p-1", "number": 3, "node_errors": {}}))
}

async fn history(Path(prompt_id): Path<String>) -> Response {
    if prompt_id == "missing" {
        return (StatusCode::NOT_FOUND, "no such prompt").into_response();
    }
    Json(json!({
        prompt_id: {
            "outputs": {
                "9": {"images": [{"filename": "kiln_00001_.png", "subfolder": "", "type": "output"}]},
                "12": {"gifs": [{"filename": "kiln_00001.mp4", "subfolder": "video", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true}
        }
    }))
    .into_response()
}

async fn view(Query(params): Query<HashMap<String, String>>) -> String {
    let field = |key: &str| params.get(key).cloned().unwrap_or_default();
    format!("{}:{}:{}", field("type"), field("subfolder"), field("filename"))
}

async fn object_info(Path(node_class): Path<String>) -> Response {
    match node_class.as_str() {
        "CheckpointLoaderSimple" => Json(json!({
            "CheckpointLoaderSimple": {
                "input": {"required": {"ckpt_name": [["sd_xl_base_1.0.safetensors", "flux1-dev.safetensors"]]}}
            }
        }))
        .into_response(),
        "LoraLoader" => Json(json!({
            "LoraLoader": {
                "input": {"required": {"lora_name": ["COMBO", {"options": ["detail.safetensors"]}]}}
            }
        }))
        .into_response(),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "node info unavailable").into_response(),
    }
}

async fn interrupt(State(state): State<Arc<ServerState>>) -> StatusCode {
    state.record("interrupt");
    StatusCode::OK
}

async fn queue(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> StatusCode {
    let deleted: Vec<&str> = body["delete"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    state.record(format!("queue:delete:{}", deleted.join(",")));
    StatusCode::OK
}

async fn system_stats() -> Json<Value> {
    Json(json!({
        "system": {"os": "posix", "python_version": "3.11.9", "comfyui_version": "0.3.40"},
        "devices": [{"name": "cuda:0 NVIDIA GeForce RTX 4090", "type": "cuda", "vram_total": 25757220864u64, "vram_free": 24000000000u64}]
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    let client_id = params.get("clientId").cloned().unwrap_or_default();
    state.record(format!("ws:{client_id}"));
    ws.on_upgrade(move |socket| run_script(socket, state))
}

async fn run_script(mut socket: WebSocket, state: Arc<ServerState>) {
    if state.script.wait_for_prompt {
        state.prompted.notified().await;
    }
    for frame in &state.script.frames {
        if socket.send(Message::Text(frame.clone().into())).await.is_err() {
            return;
        }
    }
    if state.script.close_after_frames {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    // Idle until the client goes away.
    while let Some(Ok(_)) = socket.recv().await {}
}
