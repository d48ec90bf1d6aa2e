use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::json;
use tracing::{info, warn};

use crate::error::{FileprocError, Result, StoreError, ValidationError};
use crate::models::{Job, Pipeline, PipelineStep, ProcessingType};
use crate::store::{self, RecordFilter, RecordKind, Store};

/// Built-in pipelines plus validated custom ones.
pub struct PipelineRegistry {
    builtins: HashMap<String, Pipeline>,
    custom: RwLock<HashMap<String, Pipeline>>,
    store: Arc<dyn Store>,
}

impl PipelineRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let builtins = builtin_pipelines()
            .into_iter()
            .map(|p| (p.pipeline_id.clone(), p))
            .collect();
        Self {
            builtins,
            custom: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Reloads persisted custom pipelines. Returns how many were loaded.
    pub async fn load(&self) -> std::result::Result<usize, StoreError> {
        let stored: Vec<Pipeline> = store::query_as(
            self.store.as_ref(),
            RecordKind::Pipeline,
            &RecordFilter::default(),
            usize::MAX,
            0,
        )
        .await?;

        let mut custom = self.custom_write();
        let mut loaded = 0;
        for pipeline in stored {
            if self.builtins.contains_key(&pipeline.pipeline_id) {
                warn!(pipeline_id = %pipeline.pipeline_id, "Ignoring stored pipeline that shadows a built-in");
                continue;
            }
            custom.insert(pipeline.pipeline_id.clone(), pipeline);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Built-ins first, then custom pipelines, each sorted by id.
    pub fn list(&self) -> Vec<Pipeline> {
        let mut builtins: Vec<Pipeline> = self.builtins.values().cloned().collect();
        builtins.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        let mut custom: Vec<Pipeline> = self.custom_read().values().cloned().collect();
        custom.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        builtins.extend(custom);
        builtins
    }

    pub fn get(&self, pipeline_id: &str) -> Option<Pipeline> {
        if let Some(p) = self.builtins.get(pipeline_id) {
            return Some(p.clone());
        }
        self.custom_read().get(pipeline_id).cloned()
    }

    pub fn is_builtin(&self, pipeline_id: &str) -> bool {
        self.builtins.contains_key(pipeline_id)
    }

    /// Validates and persists a custom pipeline. Re-creating an existing
    /// custom id replaces it.
    pub async fn create(&self, pipeline: Pipeline) -> Result<Pipeline> {
        if self.is_builtin(&pipeline.pipeline_id) {
            return Err(ValidationError::ReservedPipelineId(pipeline.pipeline_id).into());
        }
        pipeline.validate()?;

        store::save_as(
            self.store.as_ref(),
            RecordKind::Pipeline,
            &pipeline.pipeline_id,
            &pipeline,
        )
        .await?;
        self.custom_write()
            .insert(pipeline.pipeline_id.clone(), pipeline.clone());

        info!(pipeline_id = %pipeline.pipeline_id, steps = pipeline.steps.len(), "Created custom pipeline");
        Ok(pipeline)
    }

    /// The pipeline a job runs: its inline custom pipeline, or the registered
    /// one named by `pipeline_id`.
    pub fn resolve(&self, job: &Job) -> Result<Pipeline> {
        if let Some(custom) = &job.custom_pipeline {
            return Ok(custom.clone());
        }
        let id = job.pipeline_id.as_deref().unwrap_or_default();
        self.get(id)
            .ok_or_else(|| FileprocError::PipelineNotFound(id.to_string()))
    }

    fn custom_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Pipeline>> {
        self.custom.read().unwrap_or_else(|poisoned| {
            warn!("Pipeline registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn custom_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Pipeline>> {
        self.custom.write().unwrap_or_else(|poisoned| {
            warn!("Pipeline registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

// ─── Built-ins ───

fn formats(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn builtin(
    pipeline_id: &str,
    name: &str,
    description: &str,
    steps: Vec<PipelineStep>,
    input_formats: &[&str],
    output_formats: &[&str],
) -> Pipeline {
    Pipeline {
        pipeline_id: pipeline_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        steps,
        input_formats: formats(input_formats),
        output_formats: formats(output_formats),
    }
}

pub fn builtin_pipelines() -> Vec<Pipeline> {
    vec![
        builtin(
            "image_resize",
            "Image Resize",
            "Resize images to specified dimensions",
            vec![PipelineStep::new("resize_image", "resize_image", ProcessingType::ImageResize)
                .with_parameter("width", json!(800))
                .with_parameter("height", json!(600))
                .with_parameter("maintain_aspect_ratio", json!(true))
                .with_parameter("quality", json!(85))],
            &[".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".webp"],
            &[".jpg", ".png", ".webp"],
        ),
        builtin(
            "image_optimize",
            "Image Optimization",
            "Optimize images for web use",
            vec![
                PipelineStep::new("resize_image", "resize_image", ProcessingType::ImageResize)
                    .with_parameter("width", json!(1920))
                    .with_parameter("height", json!(1080))
                    .with_parameter("maintain_aspect_ratio", json!(true))
                    .with_parameter("upscale", json!(false)),
                PipelineStep::new(
                    "optimize_image",
                    "optimize_image",
                    ProcessingType::ImageFormatConvert,
                )
                .with_parameter("target_format", json!("webp"))
                .with_parameter("quality", json!(80))
                .depends_on("resize_image"),
            ],
            &[".jpg", ".jpeg", ".png", ".bmp", ".tiff"],
            &[".webp"],
        ),
        builtin(
            "document_extract",
            "Document Text Extraction",
            "Extract text from documents",
            vec![PipelineStep::new(
                "extract_text",
                "extract_text",
                ProcessingType::DocumentTextExtract,
            )
            .with_parameter("extract_images", json!(false))
            .with_parameter("preserve_layout", json!(true))],
            &[".pdf", ".docx", ".doc", ".txt"],
            &[".txt"],
        ),
        builtin(
            "video_thumbnail",
            "Video Thumbnail Generation",
            "Generate thumbnails from videos",
            vec![PipelineStep::new(
                "generate_thumbnail",
                "generate_thumbnail",
                ProcessingType::VideoThumbnail,
            )
            .with_parameter("width", json!(320))
            .with_parameter("height", json!(240))
            .with_parameter("quality", json!(75))
            .with_parameter("count", json!(3))],
            &[".mp4", ".avi", ".mov", ".mkv", ".webm"],
            &[".jpg"],
        ),
        builtin(
            "video_compress",
            "Video Compression",
            "Compress videos for web delivery",
            vec![PipelineStep::new(
                "compress_video",
                "compress_video",
                ProcessingType::VideoCompress,
            )
            .with_parameter("target_quality", json!("medium"))
            .with_parameter("target_bitrate", json!("1M"))
            .with_parameter("preset", json!("medium"))],
            &[".mp4", ".avi", ".mov", ".mkv"],
            &[".mp4"],
        ),
        builtin(
            "content_analysis",
            "Content Analysis",
            "Analyze and classify file content",
            vec![PipelineStep::new(
                "analyze_content",
                "analyze_content",
                ProcessingType::ContentAnalysis,
            )
            .with_parameter("extract_metadata", json!(true))
            .with_parameter("scan_for_sensitive", json!(true))
            .with_parameter("content_classification", json!(true))],
            &[".jpg", ".jpeg", ".png", ".pdf", ".docx", ".txt", ".mp4"],
            &[],
        ),
    ]
}
