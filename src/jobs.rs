use crate::constants::{
    AGE_TRANSFORM_MODEL, DEFAULT_ASPECT_RATIO, GRSAI_DOMESTIC_ENDPOINT, GRSAI_OVERSEAS_ENDPOINT,
    IMAGE_MODEL, MAX_IMAGE_BYTES, REPLICATE_PREDICTIONS_ENDPOINT, SUPPORTED_ASPECT_RATIOS,
    SUPPORTED_IMAGE_FORMATS,
};
use crate::failover::EndpointList;
use crate::types::{ArtsparkError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

const PORTRAIT_PROMPT: &str = "Create a high-resolution black-and-white portrait in an editorial, \
artistic photography style. Soft gray-to-white gradient background with fine film grain. On the \
right side of the frame, a blurred yet striking visage of {SUBJECT} emerges from the shadows, only \
fragments of the face revealed. Gentle diffused directional light, generous negative space, no \
words or logos. Intimate, timeless and hauntingly beautiful.";

const REFERENCE_SUBJECT: &str = "the person from the reference image";

const ANIMAL_LANDMARK_PROMPT: &str = "Three {ANIMAL} taking a close-up selfie in front of the \
iconic {LANDMARK}, each with a different expression, captured at golden hour with cinematic \
lighting. Heads touching, showing joy, surprise and calm. The background shows the complete \
architecture of the {LANDMARK} in warm, soft light. Photographic realistic-cartoon style, highly \
detailed, 1:1 aspect ratio.";

/// Upstream service a job kind is sent to. Each has its own credential and
/// response contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Draw API streaming SSE progress events.
    Grsai,
    /// Prediction API: one create call, then status polling.
    Replicate,
}

/// The generation tools the relay knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Portrait,
    AnimalLandmark,
    AgeTransform,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [Self::Portrait, Self::AnimalLandmark, Self::AgeTransform];

    pub fn slug(self) -> &'static str {
        match self {
            Self::Portrait => "portrait",
            Self::AnimalLandmark => "animal-landmark",
            Self::AgeTransform => "age-transform",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug.trim().to_ascii_lowercase().as_str() {
            "portrait" => Some(Self::Portrait),
            "animal-landmark" => Some(Self::AnimalLandmark),
            "age-transform" | "timemachine" => Some(Self::AgeTransform),
            _ => None,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Portrait | Self::AnimalLandmark => IMAGE_MODEL,
            Self::AgeTransform => AGE_TRANSFORM_MODEL,
        }
    }

    pub fn provider(self) -> Provider {
        match self {
            Self::Portrait | Self::AnimalLandmark => Provider::Grsai,
            Self::AgeTransform => Provider::Replicate,
        }
    }

    /// Static priority order for this kind, with the operator override first.
    pub fn endpoints(self, override_url: Option<&str>) -> Result<EndpointList> {
        let mut urls: Vec<String> = Vec::with_capacity(3);
        if let Some(url) = override_url.map(str::trim).filter(|u| !u.is_empty()) {
            urls.push(url.to_string());
        }
        let defaults: &[&str] = match self {
            Self::Portrait => &[GRSAI_OVERSEAS_ENDPOINT, GRSAI_DOMESTIC_ENDPOINT],
            Self::AnimalLandmark => &[GRSAI_DOMESTIC_ENDPOINT, GRSAI_OVERSEAS_ENDPOINT],
            Self::AgeTransform => &[REPLICATE_PREDICTIONS_ENDPOINT],
        };
        for url in defaults.iter().copied() {
            if !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
        EndpointList::new(urls)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for JobKind {
    type Err = ArtsparkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_slug(s).ok_or_else(|| ArtsparkError::UnknownJobKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortraitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimalLandmarkPayload {
    #[serde(default)]
    pub animal_type: Option<String>,
    #[serde(default)]
    pub landmark: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgeTransformPayload {
    #[serde(default)]
    pub image: Option<String>,
    /// `"default"` or an age in years.
    #[serde(default)]
    pub target_age: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobPayload {
    Portrait(PortraitPayload),
    AnimalLandmark(AnimalLandmarkPayload),
    AgeTransform(AgeTransformPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Portrait(_) => JobKind::Portrait,
            Self::AnimalLandmark(_) => JobKind::AnimalLandmark,
            Self::AgeTransform(_) => JobKind::AgeTransform,
        }
    }
}

/// A validated generation request. Built once from the HTTP body and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: JobKind,
    pub payload: JobPayload,
    pub model: String,
}

impl GenerationRequest {
    pub fn new(payload: JobPayload) -> Result<Self> {
        validate(&payload)?;
        let kind = payload.kind();
        Ok(Self {
            kind,
            payload,
            model: kind.default_model().to_string(),
        })
    }

    pub fn from_json(kind: JobKind, body: Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| ArtsparkError::Validation(format!("invalid request body: {}", e));
        let payload = match kind {
            JobKind::Portrait => JobPayload::Portrait(serde_json::from_value(body).map_err(invalid)?),
            JobKind::AnimalLandmark => {
                JobPayload::AnimalLandmark(serde_json::from_value(body).map_err(invalid)?)
            }
            JobKind::AgeTransform => {
                JobPayload::AgeTransform(serde_json::from_value(body).map_err(invalid)?)
            }
        };
        Self::new(payload)
    }

    /// Body the relay endpoint accepts for this request.
    pub fn to_relay_body(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.payload)?)
    }

    /// Body sent to the generation provider.
    pub fn upstream_body(&self) -> Value {
        match &self.payload {
            JobPayload::Portrait(p) => {
                let description = non_blank(&p.character_description);
                let reference = non_blank(&p.reference_image);
                let subject = match (description, reference.is_some()) {
                    (Some(d), true) => format!(
                        "{} and {}, a composition with two figures",
                        d, REFERENCE_SUBJECT
                    ),
                    (Some(d), false) => d.to_string(),
                    (None, _) => REFERENCE_SUBJECT.to_string(),
                };
                let size = non_blank(&p.aspect_ratio).unwrap_or(DEFAULT_ASPECT_RATIO);
                let mut body = json!({
                    "model": self.model,
                    "prompt": PORTRAIT_PROMPT.replace("{SUBJECT}", &subject),
                    "size": size,
                    "variants": 1,
                    "shutProgress": false,
                });
                if let Some(image) = reference {
                    body["image"] = Value::String(image.to_string());
                }
                body
            }
            JobPayload::AnimalLandmark(p) => {
                let animal = non_blank(&p.animal_type).unwrap_or_default();
                let landmark = non_blank(&p.landmark).unwrap_or_default();
                json!({
                    "model": self.model,
                    "prompt": ANIMAL_LANDMARK_PROMPT
                        .replace("{ANIMAL}", animal)
                        .replace("{LANDMARK}", landmark),
                    "size": DEFAULT_ASPECT_RATIO,
                    "variants": 1,
                    "shutProgress": false,
                })
            }
            JobPayload::AgeTransform(p) => json!({
                "version": self.model,
                "input": {
                    "image": p.image.as_deref().unwrap_or_default(),
                    "target_age": p.target_age.clone().unwrap_or(Value::Null),
                },
            }),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn validate(payload: &JobPayload) -> Result<()> {
    match payload {
        JobPayload::Portrait(p) => {
            if non_blank(&p.character_description).is_none() && non_blank(&p.reference_image).is_none()
            {
                return Err(validation("provide a character description or a reference image"));
            }
            if let Some(ratio) = non_blank(&p.aspect_ratio) {
                if !SUPPORTED_ASPECT_RATIOS.contains(&ratio) {
                    return Err(validation(&format!(
                        "unsupported aspect ratio '{}', expected one of {}",
                        ratio,
                        SUPPORTED_ASPECT_RATIOS.join(", ")
                    )));
                }
            }
            Ok(())
        }
        JobPayload::AnimalLandmark(p) => {
            if non_blank(&p.animal_type).is_none() || non_blank(&p.landmark).is_none() {
                return Err(validation("provide both an animal type and a landmark"));
            }
            Ok(())
        }
        JobPayload::AgeTransform(p) => {
            let Some(image) = non_blank(&p.image) else {
                return Err(validation("upload an image"));
            };
            validate_image(image)?;
            match &p.target_age {
                None | Some(Value::Null) => Err(validation("choose a target age")),
                Some(age) => validate_target_age(age),
            }
        }
    }
}

/// Accepts `data:image/<fmt>;base64,...` URLs in a supported format whose
/// decoded size stays under the cap.
pub fn validate_image(image: &str) -> Result<()> {
    let unsupported = || validation("upload a JPG, PNG or WebP image");
    let Some(rest) = image.strip_prefix("data:image/") else {
        return Err(unsupported());
    };
    let format = rest.split([';', ',']).next().unwrap_or_default().to_ascii_lowercase();
    if !SUPPORTED_IMAGE_FORMATS.contains(&format.as_str()) {
        return Err(unsupported());
    }
    let encoded_len = image.split_once(',').map(|(_, data)| data.len()).unwrap_or(0);
    if encoded_len.saturating_mul(3) / 4 > MAX_IMAGE_BYTES {
        return Err(validation(&format!(
            "image is too large, the limit is {} MiB",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

fn validate_target_age(age: &Value) -> Result<()> {
    let years = match age {
        Value::String(s) if s.trim() == "default" => return Ok(()),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    };
    match years {
        Some(y) if (0..=120).contains(&y) => Ok(()),
        _ => Err(validation("target age must be \"default\" or a whole number between 0 and 120")),
    }
}

fn validation(message: &str) -> crate::types::ObservedError {
    ArtsparkError::Validation(message.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_slugs() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::from_slug(kind.slug()), Some(kind));
        }
        assert_eq!(JobKind::from_slug("timemachine"), Some(JobKind::AgeTransform));
        assert!("nope".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_endpoint_order_per_kind() {
        let portrait = JobKind::Portrait.endpoints(None).expect("endpoints");
        assert_eq!(portrait.primary(), GRSAI_OVERSEAS_ENDPOINT);
        let animal = JobKind::AnimalLandmark.endpoints(None).expect("endpoints");
        assert_eq!(animal.primary(), GRSAI_DOMESTIC_ENDPOINT);
        let overridden = JobKind::AnimalLandmark
            .endpoints(Some("http://localhost:9000/draw"))
            .expect("endpoints");
        assert_eq!(overridden.len(), 3);
        assert_eq!(overridden.primary(), "http://localhost:9000/draw");

        let aging = JobKind::AgeTransform.endpoints(None).expect("endpoints");
        assert_eq!(aging.len(), 1);
        assert_eq!(aging.primary(), REPLICATE_PREDICTIONS_ENDPOINT);
        assert_eq!(JobKind::AgeTransform.provider(), Provider::Replicate);
        assert_eq!(JobKind::Portrait.provider(), Provider::Grsai);
    }

    #[test]
    fn test_portrait_requires_description_or_reference() {
        let err = GenerationRequest::from_json(JobKind::Portrait, json!({"characterDescription": "  "}))
            .expect_err("blank description");
        assert!(matches!(err.inner, ArtsparkError::Validation(_)));

        let req = GenerationRequest::from_json(
            JobKind::Portrait,
            json!({"referenceImage": "data:image/png;base64,AAAA"}),
        )
        .expect("reference only is valid");
        let body = req.upstream_body();
        assert_eq!(body["model"], IMAGE_MODEL);
        assert_eq!(body["image"], "data:image/png;base64,AAAA");
        assert!(body["prompt"]
            .as_str()
            .is_some_and(|p| p.contains(REFERENCE_SUBJECT)));
    }

    #[test]
    fn test_animal_prompt_substitution() {
        let req = GenerationRequest::from_json(
            JobKind::AnimalLandmark,
            json!({"animalType": " red pandas ", "landmark": "Eiffel Tower"}),
        )
        .expect("valid");
        let prompt = req.upstream_body()["prompt"].as_str().unwrap_or_default().to_string();
        assert!(prompt.starts_with("Three red pandas taking"));
        assert_eq!(prompt.matches("Eiffel Tower").count(), 2);
        assert_eq!(req.upstream_body()["size"], "1:1");
    }

    #[test]
    fn test_age_transform_validation() {
        let ok = json!({"image": "data:image/jpeg;base64,/9j/4AAQ", "targetAge": 70});
        let req = GenerationRequest::from_json(JobKind::AgeTransform, ok).expect("valid");
        let body = req.upstream_body();
        assert_eq!(body["version"], AGE_TRANSFORM_MODEL);
        assert_eq!(body["input"]["target_age"], 70);
        assert_eq!(body["input"]["image"], "data:image/jpeg;base64,/9j/4AAQ");
        assert!(body.get("shutProgress").is_none());

        let gif = json!({"image": "data:image/gif;base64,R0lG", "targetAge": "default"});
        assert!(GenerationRequest::from_json(JobKind::AgeTransform, gif).is_err());

        let no_age = json!({"image": "data:image/png;base64,AAAA"});
        assert!(GenerationRequest::from_json(JobKind::AgeTransform, no_age).is_err());

        let bad_age = json!({"image": "data:image/png;base64,AAAA", "targetAge": 300});
        assert!(GenerationRequest::from_json(JobKind::AgeTransform, bad_age).is_err());
    }

    #[test]
    fn test_oversized_image_rejected() {
        let data = "A".repeat(MAX_IMAGE_BYTES / 3 * 4 + 8);
        let image = format!("data:image/png;base64,{}", data);
        assert!(validate_image(&image).is_err());
    }

    #[test]
    fn test_relay_body_round_trips_through_from_json() {
        let req = GenerationRequest::from_json(
            JobKind::AnimalLandmark,
            json!({"animalType": "cats", "landmark": "Big Ben"}),
        )
        .expect("valid");
        let body = req.to_relay_body().expect("serializable");
        assert_eq!(body, json!({"animalType": "cats", "landmark": "Big Ben"}));
    }
}
