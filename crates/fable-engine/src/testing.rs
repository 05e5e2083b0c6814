use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fable_contracts::data_url::encode_data_url;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tokio::sync::oneshot;

use crate::backend::{
    BackendResponse, ContentPart, ContentRequest, GenerativeBackend, PredictRequest,
};

type Reply = std::result::Result<BackendResponse, String>;

enum Scripted {
    Ready(Reply),
    Pending(oneshot::Receiver<Reply>),
}

#[derive(Debug, Clone)]
pub enum ScriptedCall {
    Content {
        api_key: String,
        request: ContentRequest,
    },
    Predict {
        api_key: String,
        request: PredictRequest,
    },
}

impl ScriptedCall {
    pub fn api_key(&self) -> &str {
        match self {
            ScriptedCall::Content { api_key, .. }
            | ScriptedCall::Predict { api_key, .. } => api_key,
        }
    }
}

/// Records every request and answers from a queue of scripted replies.
#[derive(Default)]
pub struct ScriptedBackend {
    calls: Mutex<Vec<ScriptedCall>>,
    replies: Mutex<VecDeque<Scripted>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn push_images(&self, count: usize) {
        self.push(Ok(image_response(count)));
    }

    pub fn push_text(&self, text: &str) {
        self.push(Ok(BackendResponse {
            parts: vec![ContentPart::Text(text.to_string())],
        }));
    }

    pub fn push_empty(&self) {
        self.push(Ok(BackendResponse::default()));
    }

    pub fn push_error(&self, message: &str) {
        self.push(Err(message.to_string()));
    }

    /// Queues a reply that resolves only when the returned sender fires.
    pub fn push_pending(&self) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().unwrap().push_back(Scripted::Pending(rx));
        tx
    }

    fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(Scripted::Ready(reply));
    }

    async fn answer(&self, call: ScriptedCall) -> Result<BackendResponse> {
        self.calls.lock().unwrap().push(call);
        let next = self.replies.lock().unwrap().pop_front();
        let reply = match next {
            Some(Scripted::Ready(reply)) => reply,
            Some(Scripted::Pending(rx)) => rx
                .await
                .unwrap_or_else(|_| Err("scripted reply dropped".to_string())),
            None => Err("no scripted reply queued".to_string()),
        };
        reply.map_err(|message| anyhow!(message))
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_content(
        &self,
        api_key: &str,
        request: &ContentRequest,
    ) -> Result<BackendResponse> {
        self.answer(ScriptedCall::Content {
            api_key: api_key.to_string(),
            request: request.clone(),
        })
        .await
    }

    async fn predict_images(
        &self,
        api_key: &str,
        request: &PredictRequest,
    ) -> Result<BackendResponse> {
        self.answer(ScriptedCall::Predict {
            api_key: api_key.to_string(),
            request: request.clone(),
        })
        .await
    }
}

pub fn image_response(count: usize) -> BackendResponse {
    BackendResponse {
        parts: (0..count)
            .map(|idx| ContentPart::InlineImage {
                mime_type: "image/png".to_string(),
                data: format!("SU1H{idx}"),
            })
            .collect(),
    }
}

pub fn png_data_url(width: u32, height: u32) -> String {
    let image = RgbaImage::from_pixel(width, height, Rgba([30, 120, 200, 255]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    encode_data_url("image/png", out.get_ref())
}
