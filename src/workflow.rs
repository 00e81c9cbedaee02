use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::YAML_GENERATION_PROMPT;
use crate::llm::media::ImageFile;
use crate::persistence::{Snapshot, SnapshotStore};
use crate::transport::GenerativeBackend;

/// Pose instruction prefilled for stage 4, restored on reset.
pub const DEFAULT_POSE_PROMPT: &str = "笑顔で手を振る";

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("A reference image is required before generating a description")]
    MissingReferenceImage,
    #[error(
        "The original reference image file is no longer available; upload the image again to regenerate"
    )]
    ReferenceImageUnavailable,
    #[error("A generated description is required before creating a character sheet")]
    MissingDescription,
    #[error("A character sheet is required before generating a new image")]
    MissingCharacterSheet,
    #[error("A pose or composition instruction is required")]
    EmptyPosePrompt,
    #[error("API did not return any text. Please try again.")]
    EmptyDescription,
    #[error("The AI did not return an image. It might have returned text instead: {0}")]
    NoImageReturned(String),
    #[error("The stored character sheet could not be decoded: {0}")]
    InvalidCharacterSheet(String),
    #[error("{0}")]
    Backend(String),
}

/// One status per pipeline stage, so "loading and ready at the same time"
/// cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StageStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Error(String),
}

impl StageStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, StageStatus::Loading)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StageStatus::Error(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Empty,
    ImageUploaded,
    DescriptionReady,
    SheetReady,
}

/// The uploaded reference. After a snapshot restore only the preview
/// survives; `can_regenerate` is the distinct signal for "the original
/// bytes are still here".
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub image: Option<ImageFile>,
    pub preview_url: String,
}

impl ReferenceImage {
    pub fn can_regenerate(&self) -> bool {
        self.image.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CompositionImage {
    pub image: ImageFile,
    pub preview_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub url: String,
    pub text: Option<String>,
}

#[derive(Debug, Default)]
struct WorkflowState {
    /// Bumped on every upload/reset; a completion whose captured value no
    /// longer matches is stale and must be discarded.
    generation: u64,
    reference_image: Option<ReferenceImage>,
    composition_image: Option<CompositionImage>,
    generated_yaml: Option<String>,
    character_sheet: Option<String>,
    generated_image: Option<GeneratedImage>,
    pose_prompt: String,
    description_status: StageStatus,
    sheet_status: StageStatus,
    variant_status: StageStatus,
}

impl WorkflowState {
    fn fresh(generation: u64) -> Self {
        WorkflowState {
            generation,
            pose_prompt: DEFAULT_POSE_PROMPT.to_string(),
            ..WorkflowState::default()
        }
    }
}

fn record(status: &mut StageStatus, err: WorkflowError) -> WorkflowError {
    *status = StageStatus::Error(err.to_string());
    err
}

/// The four-stage generation pipeline. The lock is never held across an
/// await: each stage captures its inputs and the current generation,
/// performs the remote call, then re-locks and applies the result only if
/// the generation is unchanged.
pub struct Workflow<B> {
    backend: B,
    store: SnapshotStore,
    state: Mutex<WorkflowState>,
}

impl<B: GenerativeBackend> Workflow<B> {
    pub fn new(backend: B, store: SnapshotStore) -> Self {
        Workflow {
            backend,
            store,
            state: Mutex::new(WorkflowState::fresh(0)),
        }
    }

    /// Restores the persisted snapshot, if any. The reference image comes
    /// back preview-only: stages that need the original bytes stay
    /// unavailable until a fresh upload.
    pub fn restore(&self) -> bool {
        let Some(snapshot) = self.store.load() else {
            return false;
        };

        let mut state = self.state.lock();
        state.generation += 1;
        if !snapshot.reference_image_preview_url.is_empty() {
            state.reference_image = Some(ReferenceImage {
                image: None,
                preview_url: snapshot.reference_image_preview_url,
            });
        }
        if !snapshot.generated_yaml.is_empty() {
            state.generated_yaml = Some(snapshot.generated_yaml);
            state.description_status = StageStatus::Ready;
        }
        if let Some(sheet) = snapshot.character_sheet_url {
            if !sheet.is_empty() {
                state.character_sheet = Some(sheet);
                state.sheet_status = StageStatus::Ready;
            }
        }
        true
    }

    /// Always allowed; re-uploading further along silently discards every
    /// downstream artifact and error. The preview handle is rebuilt from
    /// the new file, never pooled.
    pub fn upload_reference_image(&self, image: ImageFile) {
        let preview_url = image.to_data_url();
        let mut state = self.state.lock();
        state.generation += 1;
        state.reference_image = Some(ReferenceImage {
            image: Some(image),
            preview_url,
        });
        state.generated_yaml = None;
        state.character_sheet = None;
        state.generated_image = None;
        state.description_status = StageStatus::Idle;
        state.sheet_status = StageStatus::Idle;
        state.variant_status = StageStatus::Idle;
    }

    pub fn upload_composition_image(&self, image: ImageFile) {
        let preview_url = image.to_data_url();
        let mut state = self.state.lock();
        state.composition_image = Some(CompositionImage { image, preview_url });
    }

    pub fn clear_composition_image(&self) {
        self.state.lock().composition_image = None;
    }

    pub fn set_pose_prompt(&self, prompt: impl Into<String>) {
        self.state.lock().pose_prompt = prompt.into();
    }

    /// Any state back to Empty. The snapshot slot is only erased when
    /// asked; an in-flight remote call is not cancelled, its late result
    /// is simply discarded by the generation guard.
    pub fn reset(&self, clear_persistence: bool) {
        {
            let mut state = self.state.lock();
            let generation = state.generation + 1;
            *state = WorkflowState::fresh(generation);
        }
        if clear_persistence {
            self.store.clear();
        }
    }

    /// Stage 2: produce the YAML description from the reference image.
    pub async fn generate_description(&self) -> Result<(), WorkflowError> {
        let (generation, image, preview_url) = {
            let mut state = self.state.lock();
            let Some(reference) = state.reference_image.clone() else {
                return Err(record(
                    &mut state.description_status,
                    WorkflowError::MissingReferenceImage,
                ));
            };
            let Some(image) = reference.image else {
                return Err(record(
                    &mut state.description_status,
                    WorkflowError::ReferenceImageUnavailable,
                ));
            };
            state.generated_yaml = None;
            state.character_sheet = None;
            state.description_status = StageStatus::Loading;
            state.sheet_status = StageStatus::Idle;
            (state.generation, image, reference.preview_url)
        };

        let result = self
            .backend
            .generate_yaml_prompt(&image, YAML_GENERATION_PROMPT)
            .await;

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("Discarding stale description result");
            return Ok(());
        }
        match result {
            Ok(text) if text.trim().is_empty() => Err(record(
                &mut state.description_status,
                WorkflowError::EmptyDescription,
            )),
            Ok(text) => {
                let yaml = text.trim().to_string();
                state.generated_yaml = Some(yaml.clone());
                state.description_status = StageStatus::Ready;
                self.persist(Snapshot {
                    reference_image_preview_url: preview_url,
                    generated_yaml: yaml,
                    character_sheet_url: None,
                });
                Ok(())
            }
            Err(err) => Err(record(
                &mut state.description_status,
                WorkflowError::Backend(err.to_string()),
            )),
        }
    }

    /// Stage 3: render the three-view character sheet. Requires both the
    /// description and the original reference bytes, so it fails after a
    /// restore even though the description is displayed.
    pub async fn generate_sheet(&self) -> Result<(), WorkflowError> {
        let (generation, image, yaml, preview_url) = {
            let mut state = self.state.lock();
            let Some(yaml) = state.generated_yaml.clone() else {
                return Err(record(
                    &mut state.sheet_status,
                    WorkflowError::MissingDescription,
                ));
            };
            let Some(reference) = state.reference_image.clone() else {
                return Err(record(
                    &mut state.sheet_status,
                    WorkflowError::MissingReferenceImage,
                ));
            };
            let Some(image) = reference.image else {
                return Err(record(
                    &mut state.sheet_status,
                    WorkflowError::ReferenceImageUnavailable,
                ));
            };
            state.generated_image = None;
            state.variant_status = StageStatus::Idle;
            state.sheet_status = StageStatus::Loading;
            (state.generation, image, yaml, reference.preview_url)
        };

        let result = self.backend.generate_character_sheet(&image, &yaml).await;

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("Discarding stale character sheet result");
            return Ok(());
        }
        match result {
            Ok(sheet_url) => {
                state.character_sheet = Some(sheet_url.clone());
                state.sheet_status = StageStatus::Ready;
                self.persist(Snapshot {
                    reference_image_preview_url: preview_url,
                    generated_yaml: yaml,
                    character_sheet_url: Some(sheet_url),
                });
                Ok(())
            }
            Err(err) => Err(record(
                &mut state.sheet_status,
                WorkflowError::Backend(err.to_string()),
            )),
        }
    }

    /// Stage 4: draw the character in a new pose. Repeatable; each success
    /// replaces the previous result, and nothing here is persisted.
    pub async fn generate_variant(&self) -> Result<(), WorkflowError> {
        let (generation, sheet_url, prompt, composition) = {
            let mut state = self.state.lock();
            let Some(sheet_url) = state.character_sheet.clone() else {
                return Err(record(
                    &mut state.variant_status,
                    WorkflowError::MissingCharacterSheet,
                ));
            };
            let prompt = state.pose_prompt.trim().to_string();
            if prompt.is_empty() {
                return Err(record(
                    &mut state.variant_status,
                    WorkflowError::EmptyPosePrompt,
                ));
            }
            let composition = state.composition_image.clone().map(|entry| entry.image);
            state.generated_image = None;
            state.variant_status = StageStatus::Loading;
            (state.generation, sheet_url, prompt, composition)
        };

        // The sheet lives as a data URL; rebuild a binary payload for
        // re-submission.
        let sheet = match ImageFile::from_data_url(&sheet_url, "character-sheet.png") {
            Ok(sheet) => sheet,
            Err(err) => {
                let mut state = self.state.lock();
                return Err(record(
                    &mut state.variant_status,
                    WorkflowError::InvalidCharacterSheet(err.to_string()),
                ));
            }
        };

        let result = self
            .backend
            .generate_new_image(&sheet, &prompt, composition.as_ref())
            .await;

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("Discarding stale variant result");
            return Ok(());
        }
        match result {
            Ok(output) => match output.image {
                Some(url) => {
                    state.generated_image = Some(GeneratedImage {
                        url,
                        text: output.text,
                    });
                    state.variant_status = StageStatus::Ready;
                    Ok(())
                }
                None => {
                    let explanation = output
                        .text
                        .unwrap_or_else(|| "No text provided".to_string());
                    Err(record(
                        &mut state.variant_status,
                        WorkflowError::NoImageReturned(explanation),
                    ))
                }
            },
            Err(err) => Err(record(
                &mut state.variant_status,
                WorkflowError::Backend(err.to_string()),
            )),
        }
    }

    fn persist(&self, snapshot: Snapshot) {
        if let Err(err) = self.store.save(&snapshot) {
            warn!("Failed to persist workflow snapshot: {err}");
        }
    }

    pub fn stage(&self) -> Stage {
        let state = self.state.lock();
        if state.character_sheet.is_some() {
            Stage::SheetReady
        } else if state.generated_yaml.is_some() {
            Stage::DescriptionReady
        } else if state.reference_image.is_some() {
            Stage::ImageUploaded
        } else {
            Stage::Empty
        }
    }

    pub fn reference_image(&self) -> Option<ReferenceImage> {
        self.state.lock().reference_image.clone()
    }

    /// Distinct from "has a preview to show": false after a restore.
    pub fn can_regenerate(&self) -> bool {
        self.state
            .lock()
            .reference_image
            .as_ref()
            .map(ReferenceImage::can_regenerate)
            .unwrap_or(false)
    }

    pub fn generated_yaml(&self) -> Option<String> {
        self.state.lock().generated_yaml.clone()
    }

    pub fn character_sheet(&self) -> Option<String> {
        self.state.lock().character_sheet.clone()
    }

    pub fn generated_image(&self) -> Option<GeneratedImage> {
        self.state.lock().generated_image.clone()
    }

    pub fn composition_preview_url(&self) -> Option<String> {
        self.state
            .lock()
            .composition_image
            .as_ref()
            .map(|entry| entry.preview_url.clone())
    }

    pub fn pose_prompt(&self) -> String {
        self.state.lock().pose_prompt.clone()
    }

    pub fn description_status(&self) -> StageStatus {
        self.state.lock().description_status.clone()
    }

    pub fn sheet_status(&self) -> StageStatus {
        self.state.lock().sheet_status.clone()
    }

    pub fn variant_status(&self) -> StageStatus {
        self.state.lock().variant_status.clone()
    }

    /// The most downstream stage error, for single-slot error display.
    pub fn current_error(&self) -> Option<String> {
        let state = self.state.lock();
        // Bound to a local so the borrow of the guard ends before it drops.
        let message = [
            &state.variant_status,
            &state.sheet_status,
            &state.description_status,
        ]
        .into_iter()
        .find_map(|status| status.error().map(|message| message.to_string()));
        message
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::llm::GeneratedOutput;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    #[derive(Debug, Clone)]
    struct RecordedVariantCall {
        prompt: String,
        has_composition: bool,
        sheet_mime: String,
    }

    #[derive(Default)]
    struct MockInner {
        yaml: Option<String>,
        sheet: Option<String>,
        new_image: Option<GeneratedOutput>,
        variant_calls: Vec<RecordedVariantCall>,
    }

    #[derive(Clone, Default)]
    struct MockBackend {
        inner: Arc<SyncMutex<MockInner>>,
        gate: Option<Arc<Notify>>,
    }

    impl MockBackend {
        fn with_yaml(self, yaml: &str) -> Self {
            self.inner.lock().yaml = Some(yaml.to_string());
            self
        }

        fn with_sheet(self, sheet: &str) -> Self {
            self.inner.lock().sheet = Some(sheet.to_string());
            self
        }

        fn with_new_image(self, output: GeneratedOutput) -> Self {
            self.inner.lock().new_image = Some(output);
            self
        }

        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }

        async fn wait_for_gate(&self) {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }

        fn variant_calls(&self) -> Vec<RecordedVariantCall> {
            self.inner.lock().variant_calls.clone()
        }
    }

    #[async_trait]
    impl GenerativeBackend for MockBackend {
        async fn generate_yaml_prompt(
            &self,
            _image: &ImageFile,
            _prompt: &str,
        ) -> anyhow::Result<String> {
            self.wait_for_gate().await;
            self.inner
                .lock()
                .yaml
                .clone()
                .ok_or_else(|| anyhow!("yaml backend failure"))
        }

        async fn generate_character_sheet(
            &self,
            _image: &ImageFile,
            _yaml_prompt: &str,
        ) -> anyhow::Result<String> {
            self.wait_for_gate().await;
            self.inner
                .lock()
                .sheet
                .clone()
                .ok_or_else(|| anyhow!("sheet backend failure"))
        }

        async fn generate_new_image(
            &self,
            character_sheet: &ImageFile,
            prompt: &str,
            composition: Option<&ImageFile>,
        ) -> anyhow::Result<GeneratedOutput> {
            self.wait_for_gate().await;
            let mut inner = self.inner.lock();
            inner.variant_calls.push(RecordedVariantCall {
                prompt: prompt.to_string(),
                has_composition: composition.is_some(),
                sheet_mime: character_sheet.mime_type.clone(),
            });
            inner
                .new_image
                .clone()
                .ok_or_else(|| anyhow!("variant backend failure"))
        }
    }

    fn reference_image() -> ImageFile {
        ImageFile::new(PNG_MAGIC.to_vec(), "image/png".to_string(), Some("image.png".to_string()))
    }

    fn sheet_data_url() -> String {
        "data:image/png;base64,AAAA".to_string()
    }

    fn workflow_with(backend: MockBackend, dir: &tempfile::TempDir) -> Workflow<MockBackend> {
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        Workflow::new(backend, store)
    }

    async fn run_to_sheet(workflow: &Workflow<MockBackend>) {
        workflow.upload_reference_image(reference_image());
        workflow.generate_description().await.unwrap();
        workflow.generate_sheet().await.unwrap();
    }

    fn full_backend() -> MockBackend {
        MockBackend::default()
            .with_yaml("metadata: {}")
            .with_sheet(&sheet_data_url())
            .with_new_image(GeneratedOutput {
                image: Some("data:image/png;base64,BBBB".to_string()),
                text: None,
            })
    }

    #[tokio::test]
    async fn pipeline_advances_through_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with(full_backend(), &dir);

        assert_eq!(workflow.stage(), Stage::Empty);
        workflow.upload_reference_image(reference_image());
        assert_eq!(workflow.stage(), Stage::ImageUploaded);

        workflow.generate_description().await.unwrap();
        assert_eq!(workflow.stage(), Stage::DescriptionReady);
        assert_eq!(workflow.generated_yaml().as_deref(), Some("metadata: {}"));

        workflow.generate_sheet().await.unwrap();
        assert_eq!(workflow.stage(), Stage::SheetReady);

        workflow.generate_variant().await.unwrap();
        let generated = workflow.generated_image().unwrap();
        assert_eq!(generated.url, "data:image/png;base64,BBBB");
        assert_eq!(workflow.variant_status(), StageStatus::Ready);
    }

    #[tokio::test]
    async fn reupload_clears_downstream_artifacts_at_any_stage() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with(full_backend(), &dir);
        run_to_sheet(&workflow).await;
        workflow.generate_variant().await.unwrap();

        workflow.upload_reference_image(reference_image());

        assert_eq!(workflow.stage(), Stage::ImageUploaded);
        assert!(workflow.generated_yaml().is_none());
        assert!(workflow.character_sheet().is_none());
        assert!(workflow.generated_image().is_none());
        assert_eq!(workflow.description_status(), StageStatus::Idle);
        assert!(workflow.current_error().is_none());
    }

    #[tokio::test]
    async fn description_success_persists_snapshot_with_null_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        let workflow = Workflow::new(full_backend(), store.clone());

        workflow.upload_reference_image(reference_image());
        workflow.generate_description().await.unwrap();

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.generated_yaml, "metadata: {}");
        assert!(snapshot
            .reference_image_preview_url
            .starts_with("data:image/png;base64,"));
        assert_eq!(snapshot.character_sheet_url, None);

        workflow.generate_sheet().await.unwrap();
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.character_sheet_url, Some(sheet_data_url()));
    }

    #[tokio::test]
    async fn whitespace_description_fails_stage_and_leaves_yaml_unset() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with(MockBackend::default().with_yaml("  \n\t"), &dir);

        workflow.upload_reference_image(reference_image());
        let err = workflow.generate_description().await.unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyDescription));
        assert!(workflow.generated_yaml().is_none());
        assert_eq!(workflow.stage(), Stage::ImageUploaded);
        assert!(workflow
            .current_error()
            .unwrap()
            .contains("did not return any text"));
    }

    #[tokio::test]
    async fn backend_failure_records_error_and_keeps_stage() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with(MockBackend::default(), &dir);

        workflow.upload_reference_image(reference_image());
        let err = workflow.generate_description().await.unwrap_err();
        assert!(matches!(err, WorkflowError::Backend(_)));
        assert_eq!(workflow.stage(), Stage::ImageUploaded);
        assert!(!workflow.description_status().is_loading());
    }

    #[tokio::test]
    async fn description_without_upload_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with(full_backend(), &dir);

        let err = workflow.generate_description().await.unwrap_err();
        assert!(matches!(err, WorkflowError::MissingReferenceImage));
    }

    #[tokio::test]
    async fn restore_shows_artifacts_but_disables_regeneration() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        {
            let workflow = Workflow::new(full_backend(), store.clone());
            run_to_sheet(&workflow).await;
        }

        let restored = Workflow::new(full_backend(), store);
        assert!(restored.restore());
        assert_eq!(restored.stage(), Stage::SheetReady);
        assert_eq!(restored.generated_yaml().as_deref(), Some("metadata: {}"));
        assert_eq!(restored.character_sheet(), Some(sheet_data_url()));
        assert!(restored.reference_image().is_some());
        assert!(!restored.can_regenerate());

        let err = restored.generate_sheet().await.unwrap_err();
        assert!(matches!(err, WorkflowError::ReferenceImageUnavailable));
        let err = restored.generate_description().await.unwrap_err();
        assert!(matches!(err, WorkflowError::ReferenceImageUnavailable));
    }

    #[tokio::test]
    async fn restore_without_snapshot_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with(full_backend(), &dir);
        assert!(!workflow.restore());
        assert_eq!(workflow.stage(), Stage::Empty);
    }

    #[tokio::test]
    async fn variant_passes_composition_through_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let backend = full_backend();
        let workflow = workflow_with(backend.clone(), &dir);
        run_to_sheet(&workflow).await;

        workflow.generate_variant().await.unwrap();
        workflow.upload_composition_image(reference_image());
        workflow.generate_variant().await.unwrap();

        let calls = backend.variant_calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].has_composition);
        assert!(calls[1].has_composition);
        assert_eq!(calls[0].prompt, DEFAULT_POSE_PROMPT);
        assert_eq!(calls[0].sheet_mime, "image/png");
    }

    #[tokio::test]
    async fn variant_refusal_surfaces_text_and_keeps_stage_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = full_backend().with_new_image(GeneratedOutput {
            image: None,
            text: Some("safety refusal".to_string()),
        });
        let workflow = workflow_with(backend.clone(), &dir);
        run_to_sheet(&workflow).await;

        let err = workflow.generate_variant().await.unwrap_err();
        assert!(err.to_string().contains("safety refusal"));
        assert!(workflow.generated_image().is_none());
        assert_eq!(workflow.stage(), Stage::SheetReady);

        // Retry after the backend recovers.
        backend.inner.lock().new_image = Some(GeneratedOutput {
            image: Some("data:image/png;base64,CCCC".to_string()),
            text: Some("done".to_string()),
        });
        workflow.generate_variant().await.unwrap();
        let generated = workflow.generated_image().unwrap();
        assert_eq!(generated.text.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn variant_requires_sheet_and_pose_text() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with(full_backend(), &dir);

        let err = workflow.generate_variant().await.unwrap_err();
        assert!(matches!(err, WorkflowError::MissingCharacterSheet));

        run_to_sheet(&workflow).await;
        workflow.set_pose_prompt("   ");
        let err = workflow.generate_variant().await.unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyPosePrompt));
    }

    #[tokio::test]
    async fn undecodable_sheet_fails_variant() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        store
            .save(&Snapshot {
                reference_image_preview_url: "data:image/png;base64,AAAA".to_string(),
                generated_yaml: "metadata: {}".to_string(),
                character_sheet_url: Some("not-a-data-url".to_string()),
            })
            .unwrap();

        let workflow = Workflow::new(full_backend(), store);
        assert!(workflow.restore());
        let err = workflow.generate_variant().await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidCharacterSheet(_)));
    }

    #[tokio::test]
    async fn stale_response_after_reset_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let backend = full_backend().gated(gate.clone());
        let workflow = Arc::new(workflow_with(backend, &dir));

        workflow.upload_reference_image(reference_image());
        let in_flight = {
            let workflow = workflow.clone();
            tokio::spawn(async move { workflow.generate_description().await })
        };
        tokio::task::yield_now().await;

        workflow.reset(true);
        gate.notify_one();
        in_flight.await.unwrap().unwrap();

        assert_eq!(workflow.stage(), Stage::Empty);
        assert!(workflow.generated_yaml().is_none());
        assert_eq!(workflow.description_status(), StageStatus::Idle);
    }

    #[tokio::test]
    async fn stale_response_after_reupload_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let backend = full_backend().gated(gate.clone());
        let workflow = Arc::new(workflow_with(backend, &dir));

        workflow.upload_reference_image(reference_image());
        let in_flight = {
            let workflow = workflow.clone();
            tokio::spawn(async move { workflow.generate_description().await })
        };
        tokio::task::yield_now().await;

        workflow.upload_reference_image(reference_image());
        gate.notify_one();
        in_flight.await.unwrap().unwrap();

        // The new upload's downstream state stays cleared.
        assert!(workflow.generated_yaml().is_none());
        assert_eq!(workflow.description_status(), StageStatus::Idle);
    }

    #[tokio::test]
    async fn current_error_reports_most_downstream_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = full_backend().with_new_image(GeneratedOutput {
            image: None,
            text: Some("safety refusal".to_string()),
        });
        let workflow = workflow_with(backend, &dir);

        assert!(workflow.current_error().is_none());
        run_to_sheet(&workflow).await;
        workflow.generate_variant().await.unwrap_err();

        let message = workflow.current_error().unwrap();
        assert!(message.contains("safety refusal"));
    }

    #[tokio::test]
    async fn regenerating_sheet_resets_variant_stage() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with(full_backend(), &dir);
        run_to_sheet(&workflow).await;
        workflow.generate_variant().await.unwrap();
        assert_eq!(workflow.variant_status(), StageStatus::Ready);

        workflow.generate_sheet().await.unwrap();

        assert!(workflow.generated_image().is_none());
        assert_eq!(workflow.variant_status(), StageStatus::Idle);
    }

    #[tokio::test]
    async fn reset_restores_default_pose_prompt_and_clears_slot_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        let workflow = Workflow::new(full_backend(), store.clone());
        run_to_sheet(&workflow).await;
        workflow.set_pose_prompt("ジャンプする");

        workflow.reset(false);
        assert_eq!(workflow.stage(), Stage::Empty);
        assert_eq!(workflow.pose_prompt(), DEFAULT_POSE_PROMPT);
        assert!(store.load().is_some());

        workflow.reset(true);
        assert!(store.load().is_none());
    }
}
