//! Splits mixed requests into ordered mode-specific segments.
//!
//! LLM-first with a keyword fallback. Segments are NEVER sorted by
//! `start_pos`: models hallucinate positions, so emission order is the
//! contract and profile priority stays metadata.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use triad_config::SegmentationConfig;
use triad_provider::{extract_json, ChatRequest, LlmClient, LlmTier, Message};

use crate::routing::{Mode, ModeProfile, ModeRouter};

#[derive(Debug, Clone)]
pub struct RequestSegment {
    /// Substring of the original request.
    pub text: String,
    pub mode: Mode,
    /// Lower = earlier in the mode's processing order; metadata only.
    pub priority: i32,
    pub reason: String,
    pub start_pos: usize,
    pub end_pos: usize,
    pub profile: ModeProfile,
}

pub struct RequestSegmenter {
    router: Arc<ModeRouter>,
    llm: Option<Arc<dyn LlmClient>>,
    config: SegmentationConfig,
    segmentation_count: AtomicU64,
    fallback_count: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SegmenterStats {
    pub total_segmentations: u64,
    pub fallback_segmentations: u64,
    pub segmentation_enabled: bool,
}

impl RequestSegmenter {
    pub fn new(
        router: Arc<ModeRouter>,
        llm: Option<Arc<dyn LlmClient>>,
        config: SegmentationConfig,
    ) -> Self {
        Self {
            router,
            llm,
            config,
            segmentation_count: AtomicU64::new(0),
            fallback_count: AtomicU64::new(0),
        }
    }

    pub async fn split_request(
        &self,
        user_request: &str,
        history: &[String],
        context: Option<&Value>,
    ) -> Vec<RequestSegment> {
        let count = self.segmentation_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(n = count, request = %truncate(user_request, 100), "Segmenting request");

        if !self.config.enabled || user_request.trim().is_empty() {
            return vec![self.make_segment(
                user_request,
                Mode::Chat,
                "Segmentation disabled",
                0,
                user_request.len(),
            )];
        }

        if let Some(llm) = &self.llm {
            match self.llm_segmentation(llm, user_request, history, context).await {
                Ok(segments) if !segments.is_empty() => {
                    tracing::info!(count = segments.len(), "LLM segmentation succeeded");
                    return self.merge_and_cap(segments);
                }
                Ok(_) => {
                    // Valid JSON, zero usable segments. Questions still need
                    // answers, so split them by hand.
                    tracing::warn!("LLM returned no usable segments, splitting questions manually");
                    let segments = self.question_segments(user_request);
                    if !segments.is_empty() {
                        return self.merge_and_cap(segments);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "LLM segmentation failed");
                }
            }
        }

        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        let segments = self.keyword_segmentation(user_request);
        self.merge_and_cap(segments)
    }

    async fn llm_segmentation(
        &self,
        llm: &Arc<dyn LlmClient>,
        user_request: &str,
        history: &[String],
        context: Option<&Value>,
    ) -> anyhow::Result<Vec<RequestSegment>> {
        let system = self.segmentation_system_prompt();
        let mut prompt = format!("REQUEST TO ANALYZE:\n\"{user_request}\"\n");
        if !history.is_empty() {
            let recent: Vec<&String> = history.iter().rev().take(3).rev().collect();
            prompt.push_str(&format!("\nCONVERSATION CONTEXT:\n{recent:?}\n"));
        }
        if let Some(context) = context {
            prompt.push_str(&format!("\nADDITIONAL CONTEXT:\n{context}\n"));
        }
        prompt.push_str(
            "\nTASK:\nSplit this request into logical segments by intent mode. \
             Maintain the original order from the user's request.",
        );

        let response = llm
            .chat(
                &ChatRequest::new(
                    LlmTier::Standard,
                    vec![Message::system(system), Message::user(prompt)],
                )
                .with_temperature(0.1),
            )
            .await?;

        let parsed = extract_json(&response.content)
            .ok_or_else(|| anyhow::anyhow!("segmentation reply was not JSON"))?;
        let raw_segments = parsed["segments"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut segments = Vec::new();
        for raw in raw_segments {
            let text = raw["text"].as_str().unwrap_or_default().trim().to_string();
            let Some(mode) = raw["mode"].as_str().and_then(Mode::parse) else {
                tracing::warn!(mode = ?raw["mode"], "Segment with unknown mode dropped");
                continue;
            };
            if !self.segment_is_valid(&text, mode, user_request) {
                tracing::warn!(text = %truncate(&text, 40), "Invalid segment dropped");
                continue;
            }
            segments.push(self.make_segment(
                &text,
                mode,
                raw["reason"].as_str().unwrap_or("LLM segmentation"),
                raw["start_pos"].as_u64().unwrap_or(0) as usize,
                raw["end_pos"].as_u64().unwrap_or(0) as usize,
            ));
        }
        Ok(segments)
    }

    fn segmentation_system_prompt(&self) -> String {
        let mut modes: Vec<(Mode, i32, Vec<String>)> = Mode::ALL
            .iter()
            .map(|m| (*m, self.router.mode_priority(*m), self.router.split_keywords(*m)))
            .collect();
        modes.sort_by_key(|(_, priority, _)| *priority);

        let mut lines = vec![
            "You are a request segmentation expert. Split the user request into logical \
             segments by intent mode."
                .to_string(),
            String::new(),
            "AVAILABLE MODES (lower priority number = processed first):".to_string(),
        ];
        for (mode, priority, keywords) in modes {
            lines.push(format!(
                "{priority}. {}: keywords {:?}",
                mode.as_str(),
                keywords
            ));
        }
        lines.push(String::new());
        lines.push(
            "CRITICAL RULES:\n\
             - Identity/mission/consciousness questions are ALWAYS deep_chat (priority 1), \
               in any language, even inside long complex requests.\n\
             - Numbered questions (1., 2., 3.) are separate segments.\n\
             - Each segment's text must be copied verbatim from the request.\n\
             - Minimum 3 words per segment, except chat mode.\n\
             - Maximum 5 segments.\n\
             \n\
             OUTPUT JSON:\n\
             {\"segments\": [{\"text\": \"...\", \"mode\": \"mode_name\", \"reason\": \"...\", \
             \"start_pos\": 0, \"end_pos\": 0, \"confidence\": 0.9}]}"
                .to_string(),
        );
        lines.join("\n")
    }

    fn segment_is_valid(&self, text: &str, mode: Mode, full_request: &str) -> bool {
        if text.is_empty() || !full_request.contains(text) {
            return false;
        }
        if mode != Mode::Chat && text.split_whitespace().count() < self.config.min_segment_length {
            return false;
        }
        true
    }

    /// Linear keyword scan: a split keyword closes the current segment and
    /// opens a new one in the detected mode.
    fn keyword_segmentation(&self, user_request: &str) -> Vec<RequestSegment> {
        let words: Vec<&str> = user_request.split_whitespace().collect();
        let mut segments = Vec::new();
        let mut current_words: Vec<&str> = Vec::new();
        let mut current_mode: Option<Mode> = None;
        let mut current_start = 0usize;

        for &word in &words {
            let word_lower = word.to_lowercase();
            let detected = Mode::ALL.iter().copied().find(|mode| {
                self.router
                    .split_keywords(*mode)
                    .iter()
                    .any(|kw| word_lower.contains(kw.as_str()))
            });

            match detected {
                Some(mode) if Some(mode) != current_mode && !current_words.is_empty() => {
                    let text = current_words.join(" ");
                    if text.split_whitespace().count() >= self.config.min_segment_length
                        || current_mode == Some(Mode::Chat)
                    {
                        let seg_mode = current_mode.unwrap_or(Mode::Chat);
                        segments.push(self.make_segment(
                            &text,
                            seg_mode,
                            &format!("Keyword detection: {seg_mode}"),
                            current_start,
                            current_start + text.len(),
                        ));
                    }
                    current_start = user_request.find(word).unwrap_or(current_start);
                    current_words = vec![word];
                    current_mode = Some(mode);
                }
                Some(mode) => {
                    current_words.push(word);
                    if current_mode.is_none() {
                        current_mode = Some(mode);
                    }
                }
                None => {
                    current_words.push(word);
                }
            }
        }

        if !current_words.is_empty() {
            let text = current_words.join(" ");
            if text.split_whitespace().count() >= self.config.min_segment_length
                || current_mode == Some(Mode::Chat)
                || segments.is_empty()
            {
                let seg_mode = current_mode.unwrap_or(Mode::Chat);
                segments.push(self.make_segment(
                    &text,
                    seg_mode,
                    &format!("Keyword detection: {seg_mode}"),
                    current_start,
                    user_request.len(),
                ));
            }
        }

        if segments.is_empty() {
            segments.push(self.make_segment(
                user_request,
                Mode::Chat,
                "No segmentation detected",
                0,
                user_request.len(),
            ));
        }
        segments
    }

    /// Manual splitter for question lists when the LLM returns nothing.
    fn question_segments(&self, user_request: &str) -> Vec<RequestSegment> {
        const DEEP_MARKERS: &[&str] = &[
            "створили", "місія", "особистість", "хто ти", "душа", "who created", "your mission",
            "consciousness",
        ];
        const INFO_MARKERS: &[&str] = &[
            "розкажи", "інформація", "знайди", "пошукай", "хто такий", "що таке", "оціни",
            "what is", "tell me about", "find",
        ];

        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        for line in user_request.split('\n') {
            let line = line.trim();
            let starts_question = line.starts_with("1.")
                || line.starts_with("2.")
                || line.starts_with("3.")
                || line.starts_with("Ким")
                || line.starts_with("Яка")
                || line.starts_with("Ти");
            if starts_question && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            if current.is_empty() {
                current = line.to_string();
            } else {
                current.push(' ');
                current.push_str(line);
            }
        }
        if !current.is_empty() {
            parts.push(current);
        }

        let mut segments = Vec::new();
        for part in parts {
            if part.split_whitespace().count() < self.config.min_segment_length {
                continue;
            }
            let lower = part.to_lowercase();
            let mode = if DEEP_MARKERS.iter().any(|m| lower.contains(m)) {
                Mode::DeepChat
            } else if INFO_MARKERS.iter().any(|m| lower.contains(m)) {
                Mode::SoloTask
            } else {
                Mode::Chat
            };
            let start = user_request.find(&part).unwrap_or(0);
            segments.push(self.make_segment(
                &part,
                mode,
                "Question segmentation (manual fallback)",
                start,
                start + part.len(),
            ));
        }
        segments
    }

    /// Merge consecutive compatible segments, then truncate to the cap.
    /// Emission order is preserved throughout.
    fn merge_and_cap(&self, segments: Vec<RequestSegment>) -> Vec<RequestSegment> {
        let mut merged: Vec<RequestSegment> = Vec::new();
        let mut i = 0;
        while i < segments.len() {
            let current = &segments[i];
            let merge_with = self.router.merge_with(current.mode);
            if i + 1 < segments.len()
                && merge_with.contains(&segments[i + 1].mode.as_str().to_string())
            {
                let next = &segments[i + 1];
                let text = format!("{} {}", current.text, next.text);
                merged.push(RequestSegment {
                    text: text.clone(),
                    mode: current.mode,
                    priority: current.priority,
                    reason: format!("Merged {}+{}", current.mode, next.mode),
                    start_pos: current.start_pos,
                    end_pos: next.end_pos,
                    profile: current.profile.clone(),
                });
                i += 2;
            } else {
                merged.push(current.clone());
                i += 1;
            }
        }

        if merged.len() > self.config.max_segments {
            tracing::warn!(
                count = merged.len(),
                max = self.config.max_segments,
                "Too many segments, truncating"
            );
            merged.truncate(self.config.max_segments);
        }
        merged
    }

    fn make_segment(
        &self,
        text: &str,
        mode: Mode,
        reason: &str,
        start_pos: usize,
        end_pos: usize,
    ) -> RequestSegment {
        let profile = self.router.build_profile(&serde_json::json!({
            "mode": mode.as_str(),
            "reason": format!("Segmented request: {}", truncate(text, 50)),
            "enriched_request": text,
        }));
        RequestSegment {
            text: text.to_string(),
            mode,
            priority: self.router.mode_priority(mode),
            reason: reason.to_string(),
            start_pos,
            end_pos,
            profile,
        }
    }

    pub fn stats(&self) -> SegmenterStats {
        SegmenterStats {
            total_segmentations: self.segmentation_count.load(Ordering::Relaxed),
            fallback_segmentations: self.fallback_count.load(Ordering::Relaxed),
            segmentation_enabled: self.config.enabled,
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}
