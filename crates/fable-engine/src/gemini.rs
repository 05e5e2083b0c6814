use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fable_contracts::config::DEFAULT_API_BASE;
use reqwest::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::backend::{
    BackendResponse, ContentPart, ContentRequest, GenerativeBackend, PredictRequest,
};

/// Gemini `generateContent` and Imagen `predict` over HTTPS.
pub struct GeminiBackend {
    api_base: String,
    http: HttpClient,
}

impl GeminiBackend {
    pub fn new(api_base: impl Into<String>) -> Self {
        let api_base = api_base.into();
        let trimmed = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if trimmed.is_empty() {
                DEFAULT_API_BASE.to_string()
            } else {
                trimmed.to_string()
            },
            http: HttpClient::new(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn endpoint_for_model(&self, model: &str, method: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:{}", self.api_base, model_path, method)
    }

    async fn post(
        &self,
        provider: &str,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<Value> {
        debug!(provider, endpoint, "posting request");
        let response = self
            .http
            .post(endpoint)
            .query(&[("key", api_key)])
            .json(payload)
            .send()
            .await
            .with_context(|| format!("{provider} request failed ({endpoint})"))?;
        response_json_or_error(provider, response).await
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate_content(
        &self,
        api_key: &str,
        request: &ContentRequest,
    ) -> Result<BackendResponse> {
        let endpoint = self.endpoint_for_model(&request.model, "generateContent");
        let payload = content_payload(request);
        let response_payload = self.post("Gemini", &endpoint, api_key, &payload).await?;
        parse_content_response(&response_payload)
    }

    async fn predict_images(
        &self,
        api_key: &str,
        request: &PredictRequest,
    ) -> Result<BackendResponse> {
        let endpoint = self.endpoint_for_model(&request.model, "predict");
        let payload = predict_payload(request);
        let response_payload = self.post("Imagen", &endpoint, api_key, &payload).await?;
        parse_predict_response(&response_payload)
    }
}

pub(crate) fn content_payload(request: &ContentRequest) -> Value {
    let parts = request
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => json!({ "text": text }),
            ContentPart::InlineImage { mime_type, data } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": data,
                }
            }),
        })
        .collect::<Vec<Value>>();

    let mut payload = Map::new();
    payload.insert(
        "contents".to_string(),
        Value::Array(vec![json!({
            "role": "user",
            "parts": parts,
        })]),
    );

    let mut generation_config = Map::new();
    if !request.response_modalities.is_empty() {
        generation_config.insert(
            "responseModalities".to_string(),
            Value::Array(
                request
                    .response_modalities
                    .iter()
                    .map(|modality| Value::String(modality.as_str().to_string()))
                    .collect(),
            ),
        );
    }
    if let Some(aspect_ratio) = request.aspect_ratio {
        generation_config.insert(
            "imageConfig".to_string(),
            json!({ "aspectRatio": aspect_ratio.as_str() }),
        );
    }
    if !generation_config.is_empty() {
        payload.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }
    Value::Object(payload)
}

pub(crate) fn predict_payload(request: &PredictRequest) -> Value {
    json!({
        "instances": [{
            "prompt": request.prompt,
        }],
        "parameters": {
            "sampleCount": request.sample_count.max(1),
            "aspectRatio": request.aspect_ratio.as_str(),
        },
    })
}

pub(crate) fn parse_content_response(response_payload: &Value) -> Result<BackendResponse> {
    let candidates = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if candidates.is_empty() {
        if let Some(reason) = response_payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            bail!("Gemini blocked the request ({reason})");
        }
    }

    let mut out = Vec::new();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                out.push(ContentPart::Text(text.to_string()));
                continue;
            }
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            out.push(ContentPart::InlineImage {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            });
        }
    }
    Ok(BackendResponse { parts: out })
}

pub(crate) fn parse_predict_response(response_payload: &Value) -> Result<BackendResponse> {
    let mut out = Vec::new();
    let predictions = response_payload
        .get("predictions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in predictions {
        let Some(obj) = row.as_object() else {
            continue;
        };
        let generated = obj
            .get("image")
            .and_then(Value::as_object)
            .or_else(|| obj.get("generatedImage").and_then(Value::as_object))
            .unwrap_or(obj);
        let Some(encoded) = generated
            .get("bytesBase64Encoded")
            .or_else(|| generated.get("imageBytes"))
            .or_else(|| generated.get("bytes_base64_encoded"))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
        else {
            continue;
        };
        let mime_type = generated
            .get("mimeType")
            .or_else(|| generated.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        out.push(ContentPart::InlineImage {
            mime_type: mime_type.to_string(),
            data: encoded.to_string(),
        });
    }
    Ok(BackendResponse { parts: out })
}

async fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .await
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use fable_contracts::models::AspectRatio;
    use serde_json::json;

    use super::*;
    use crate::backend::{DecodedOutput, ResponseModality};

    #[test]
    fn endpoint_prefixes_models_path_once() {
        let backend = GeminiBackend::new("https://example.test/v1beta/");
        assert_eq!(
            backend.endpoint_for_model("gemini-2.5-flash", "generateContent"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(
            backend.endpoint_for_model("models/imagen-4.0-generate-001", "predict"),
            "https://example.test/v1beta/models/imagen-4.0-generate-001:predict"
        );
        assert_eq!(GeminiBackend::new("  ").api_base(), DEFAULT_API_BASE);
    }

    #[test]
    fn content_payload_orders_images_before_text_and_sets_image_config() {
        let request = ContentRequest {
            model: "gemini-2.5-flash-image".to_string(),
            parts: vec![
                ContentPart::InlineImage {
                    mime_type: "image/jpeg".to_string(),
                    data: "AAAA".to_string(),
                },
                ContentPart::Text("make it night".to_string()),
            ],
            response_modalities: vec![ResponseModality::Image],
            aspect_ratio: Some(AspectRatio::Landscape16x9),
        };
        let payload = content_payload(&request);
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], json!("image/jpeg"));
        assert_eq!(parts[1]["text"], json!("make it night"));
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["IMAGE"])
        );
        assert_eq!(
            payload["generationConfig"]["imageConfig"]["aspectRatio"],
            json!("16:9")
        );
    }

    #[test]
    fn text_payload_omits_generation_config() {
        let request = ContentRequest::text(
            "gemini-2.5-flash",
            vec![ContentPart::Text("hello".to_string())],
        );
        let payload = content_payload(&request);
        assert!(payload.get("generationConfig").is_none());
    }

    #[test]
    fn predict_payload_carries_count_and_ratio() {
        let payload = predict_payload(&PredictRequest {
            model: "imagen-4.0-generate-001".to_string(),
            prompt: "a red fox in snow".to_string(),
            sample_count: 4,
            aspect_ratio: AspectRatio::Landscape16x9,
        });
        assert_eq!(payload["instances"][0]["prompt"], json!("a red fox in snow"));
        assert_eq!(payload["parameters"]["sampleCount"], json!(4));
        assert_eq!(payload["parameters"]["aspectRatio"], json!("16:9"));
    }

    #[test]
    fn content_response_collects_text_and_inline_images() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "Here is your image."},
                        {"inlineData": {"mimeType": "image/png", "data": "AAAA"}},
                        {"inline_data": {"mime_type": "image/webp", "data": "BBBB"}},
                        {"inlineData": {"mimeType": "image/png", "data": ""}}
                    ]
                }
            }]
        });
        let response = parse_content_response(&payload)?;
        assert_eq!(response.parts.len(), 3);
        assert_eq!(
            response.decode(),
            DecodedOutput::Images(vec![
                "data:image/png;base64,AAAA".to_string(),
                "data:image/webp;base64,BBBB".to_string(),
            ])
        );
        Ok(())
    }

    #[test]
    fn blocked_prompt_is_reported() {
        let payload = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = parse_content_response(&payload).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn predict_response_accepts_flat_and_nested_shapes() -> anyhow::Result<()> {
        let payload = json!({
            "predictions": [
                {"bytesBase64Encoded": "AAAA", "mimeType": "image/png"},
                {"generatedImage": {"imageBytes": "BBBB", "mimeType": "image/jpeg"}},
                {"raiFilteredReason": "blocked"}
            ]
        });
        let response = parse_predict_response(&payload)?;
        assert_eq!(
            response.decode(),
            DecodedOutput::Images(vec![
                "data:image/png;base64,AAAA".to_string(),
                "data:image/jpeg;base64,BBBB".to_string(),
            ])
        );
        Ok(())
    }

    #[test]
    fn truncate_text_appends_ellipsis() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
