use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::job::Metadata;

/// Closed set of processing operations a pipeline step can invoke.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingType {
    ImageResize,
    ImageFormatConvert,
    DocumentTextExtract,
    DocumentPdfGenerate,
    VideoThumbnail,
    VideoCompress,
    ContentAnalysis,
    Custom,
}

impl ProcessingType {
    pub const ALL: [ProcessingType; 8] = [
        ProcessingType::ImageResize,
        ProcessingType::ImageFormatConvert,
        ProcessingType::DocumentTextExtract,
        ProcessingType::DocumentPdfGenerate,
        ProcessingType::VideoThumbnail,
        ProcessingType::VideoCompress,
        ProcessingType::ContentAnalysis,
        ProcessingType::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingType::ImageResize => "image_resize",
            ProcessingType::ImageFormatConvert => "image_format_convert",
            ProcessingType::DocumentTextExtract => "document_text_extract",
            ProcessingType::DocumentPdfGenerate => "document_pdf_generate",
            ProcessingType::VideoThumbnail => "video_thumbnail",
            ProcessingType::VideoCompress => "video_compress",
            ProcessingType::ContentAnalysis => "content_analysis",
            ProcessingType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_step_timeout() -> u64 {
    300
}

fn default_step_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStep {
    pub step_id: String,
    pub name: String,
    pub processing_type: ProcessingType,
    #[serde(default)]
    pub parameters: Metadata,
    /// Referenced step ids. Checked for integrity only; steps run in list order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
    /// Advisory; job-level retries are governed by the retry policy.
    #[serde(default = "default_step_retries")]
    pub retry_count: u32,
}

impl PipelineStep {
    pub fn new(step_id: &str, name: &str, processing_type: ProcessingType) -> Self {
        Self {
            step_id: step_id.to_string(),
            name: name.to_string(),
            processing_type,
            parameters: Metadata::new(),
            depends_on: Vec::new(),
            timeout_seconds: default_step_timeout(),
            retry_count: default_step_retries(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn depends_on(mut self, step_id: &str) -> Self {
        self.depends_on.push(step_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    pub pipeline_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<PipelineStep>,
    /// Accepted input extensions, e.g. `.jpg`. Empty accepts anything.
    #[serde(default)]
    pub input_formats: Vec<String>,
    #[serde(default)]
    pub output_formats: Vec<String>,
}

impl Pipeline {
    /// Processing types of all steps, in step order.
    pub fn processing_types(&self) -> Vec<ProcessingType> {
        self.steps.iter().map(|s| s.processing_type).collect()
    }

    /// Whether the file's extension is on the input allow-list.
    pub fn accepts(&self, path: &Path) -> bool {
        if self.input_formats.is_empty() {
            return true;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = format!(".{}", ext.to_ascii_lowercase());
        self.input_formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&ext))
    }

    /// Structural checks for custom pipelines: id and name present, at least
    /// one step, unique named steps, and every `depends_on` resolving to
    /// another step of this pipeline.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidPipeline {
            pipeline_id: self.pipeline_id.clone(),
            reason,
        };

        if self.pipeline_id.trim().is_empty() {
            return Err(invalid("pipeline_id must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("pipeline must have at least one step".to_string()));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                return Err(invalid("every step needs a step_id".to_string()));
            }
            if step.name.trim().is_empty() {
                return Err(invalid(format!("step '{}' has no name", step.step_id)));
            }
            if !ids.insert(step.step_id.as_str()) {
                return Err(invalid(format!("duplicate step_id '{}'", step.step_id)));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.step_id {
                    return Err(invalid(format!("step '{}' depends on itself", step.step_id)));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(invalid(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.step_id, dep
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(steps: Vec<PipelineStep>) -> Pipeline {
        Pipeline {
            pipeline_id: "custom-1".into(),
            name: "Custom".into(),
            description: String::new(),
            steps,
            input_formats: vec![".jpg".into(), ".png".into()],
            output_formats: vec![],
        }
    }

    #[test]
    fn test_accepts_is_case_insensitive() {
        let p = pipeline(vec![PipelineStep::new("a", "A", ProcessingType::ImageResize)]);
        assert!(p.accepts(Path::new("/files/photo.JPG")));
        assert!(p.accepts(Path::new("photo.png")));
        assert!(!p.accepts(Path::new("doc.pdf")));
        assert!(!p.accepts(Path::new("no_extension")));
    }

    #[test]
    fn test_empty_input_formats_accept_anything() {
        let mut p = pipeline(vec![PipelineStep::new("a", "A", ProcessingType::Custom)]);
        p.input_formats.clear();
        assert!(p.accepts(Path::new("anything.bin")));
    }

    #[test]
    fn test_validate_requires_steps() {
        let err = pipeline(vec![]).validate().unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_validate_rejects_dangling_dependency() {
        let p = pipeline(vec![
            PipelineStep::new("a", "A", ProcessingType::ImageResize),
            PipelineStep::new("b", "B", ProcessingType::ImageFormatConvert).depends_on("zzz"),
        ]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("unknown step 'zzz'"));
    }

    #[test]
    fn test_validate_accepts_forward_reference() {
        // depends_on is referential only; ordering is by list position.
        let p = pipeline(vec![
            PipelineStep::new("a", "A", ProcessingType::ImageResize).depends_on("b"),
            PipelineStep::new("b", "B", ProcessingType::ImageFormatConvert),
        ]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unnamed_step_and_duplicates() {
        let p = pipeline(vec![PipelineStep::new("a", "", ProcessingType::ImageResize)]);
        assert!(p.validate().is_err());

        let p = pipeline(vec![
            PipelineStep::new("a", "A", ProcessingType::ImageResize),
            PipelineStep::new("a", "A2", ProcessingType::ImageResize),
        ]);
        assert!(p.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_step_defaults_from_json() {
        let step: PipelineStep = serde_json::from_str(
            r#"{"step_id":"s","name":"S","processing_type":"video_compress"}"#,
        )
        .unwrap();
        assert_eq!(step.timeout_seconds, 300);
        assert_eq!(step.retry_count, 3);
        assert!(step.depends_on.is_empty());
        assert_eq!(step.processing_type, ProcessingType::VideoCompress);
    }
}
