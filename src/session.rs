//! Drives one question through bounded attempts to a single outcome.
//!
//! Every attempt checks memory pressure, makes sure the model is loaded and
//! runs one completion. A failed attempt unloads the model so the next one
//! starts from a freshly built handle. Running out of attempts is reported as
//! a value, never as an error.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::config::ThinkerConfig;
use crate::engine::InferenceEngine;
use crate::error::SessionError;
use crate::lifecycle::ModelLifecycle;
use crate::logger::{file_timestamp, SessionLog};
use crate::memory::MemoryMonitor;

/// Duration reported when no attempt succeeded.
pub const FAILURE_DURATION: &str = "00:00:00";

const SEPARATOR_WIDTH: usize = 50;

/// Wrap a question in the step-by-step reasoning instructions.
pub fn build_prompt(question: &str) -> String {
    format!(
        "Pergunta: {question}\n\nPor favor, pense passo a passo e explique seu raciocínio em detalhes antes de fornecer a resposta final. Certifique-se de que a resposta seja completa e bem estruturada.\n\nResposta:"
    )
}

/// Render as zero-padded `HH:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// What happened during one try.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-based.
    pub index: u32,
    pub memory_before_mb: Option<f64>,
    pub memory_after_mb: Option<f64>,
    pub inference_duration: Option<Duration>,
    pub pressure_remediated: bool,
    pub error: Option<String>,
}

impl AttemptRecord {
    fn start(index: u32) -> Self {
        Self {
            index,
            memory_before_mb: None,
            memory_after_mb: None,
            inference_duration: None,
            pressure_remediated: false,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Terminal result of a session.
///
/// On failure `answer` holds the error message, `duration` is
/// [`FAILURE_DURATION`] and `memory_used` is 0.0.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub answer: String,
    pub duration: String,
    pub memory_used: f64,
    pub attempts: Vec<AttemptRecord>,
    pub log_path: PathBuf,
    success: bool,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// `(answer, formatted duration, memory used)`.
    pub fn into_parts(self) -> (String, String, f64) {
        (self.answer, self.duration, self.memory_used)
    }
}

struct AttemptSuccess {
    answer: String,
    inference_time: Duration,
    memory_used: f64,
}

/// Session driver around one lazily loaded model.
pub struct Thinker<E: InferenceEngine> {
    config: ThinkerConfig,
    memory: MemoryMonitor,
    lifecycle: ModelLifecycle<E>,
    default_log: SessionLog,
}

impl<E: InferenceEngine> Thinker<E> {
    pub fn new(engine: E, config: ThinkerConfig, memory: MemoryMonitor) -> Result<Self, SessionError> {
        config.validate()?;
        std::fs::create_dir_all(&config.log_dir)?;
        std::fs::create_dir_all(&config.output_dir)?;

        let default_log = SessionLog::open_default(&config.output_dir);
        match memory.current_usage() {
            Ok(mb) => default_log.write(&format!("Memória inicial: {mb:.2} MB")),
            Err(e) => default_log.write(&e.to_string()),
        }

        let lifecycle = ModelLifecycle::new(engine, config.model.clone(), memory.clone());
        Ok(Self {
            config,
            memory,
            lifecycle,
            default_log,
        })
    }

    pub fn lifecycle(&self) -> &ModelLifecycle<E> {
        &self.lifecycle
    }

    pub fn default_log(&self) -> &SessionLog {
        &self.default_log
    }

    /// Answer `question`, retrying up to the configured number of attempts.
    pub fn process_question(&mut self, question: &str) -> SessionOutcome {
        let session_start = Instant::now();
        let session_id = file_timestamp(&Local::now());
        let max_retries = self.config.retry.max_retries;

        // Named once; every attempt of this question writes here.
        let log = SessionLog::open_for(&self.config.output_dir, question);
        log.write(&"#".repeat(SEPARATOR_WIDTH));
        log.write(&format!("Início da sessão: {session_id}"));
        log.write(&format!("Pergunta recebida: {question}"));
        log.write(&self.memory_line("Uso de memória inicial"));
        log::info!("Session {session_id} started, log at {}", log.path().display());

        let mut attempts = Vec::with_capacity(max_retries as usize);
        let mut last_error: Option<SessionError> = None;

        for index in 1..=max_retries {
            let mut record = AttemptRecord::start(index);
            log.write(&format!("Tentativa {index}/{max_retries}"));

            match self.run_attempt(question, &log, &mut record) {
                Ok(success) => {
                    attempts.push(record);
                    let time_msg = format_duration(success.inference_time);
                    log.write(&format!("Resposta gerada em {time_msg}"));
                    log.write(&format!("RESPOSTA: {}", success.answer));
                    self.finish_session(&log, &session_id, session_start, '#');
                    log::info!("Session {session_id} answered on attempt {index}/{max_retries}");

                    return SessionOutcome {
                        session_id,
                        answer: success.answer,
                        duration: time_msg,
                        memory_used: success.memory_used,
                        attempts,
                        log_path: log.path().to_path_buf(),
                        success: true,
                    };
                }
                Err(err) => {
                    record.error = Some(err.to_string());
                    attempts.push(record);
                    log.write(&format!(
                        "Erro ao processar pergunta (tentativa {index}/{max_retries}): {err}"
                    ));
                    log.write(&format!("Detalhes do erro: {err:?}"));
                    log::warn!("Attempt {index}/{max_retries} of session {session_id} failed: {err}");

                    self.lifecycle.release();

                    if index < max_retries {
                        thread::sleep(self.config.retry.retry_delay);
                    }
                    last_error = Some(err);
                }
            }
        }

        self.finish_session(&log, &session_id, session_start, '-');
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        log::error!("Session {session_id} gave up after {max_retries} attempts: {reason}");

        SessionOutcome {
            session_id,
            answer: format!("Erro no processamento após {max_retries} tentativas: {reason}"),
            duration: FAILURE_DURATION.to_string(),
            memory_used: 0.0,
            attempts,
            log_path: log.path().to_path_buf(),
            success: false,
        }
    }

    fn run_attempt(
        &mut self,
        question: &str,
        log: &SessionLog,
        record: &mut AttemptRecord,
    ) -> Result<AttemptSuccess, SessionError> {
        if self.memory.is_critical()? {
            log.write("AVISO: Uso de memória crítico. Tentando liberar recursos...");
            log::warn!(
                "Resident memory above {:.0} MB, asking allocator to release memory",
                self.memory.threshold_mb()
            );
            self.memory.reclaim();
            record.pressure_remediated = true;
            thread::sleep(self.config.retry.pressure_pause);
        }

        let memory_used = self.lifecycle.ensure_ready(log)?;

        let prompt = build_prompt(question);
        record.memory_before_mb = Some(self.memory.current_usage()?);
        let started = Instant::now();
        let completion = self.lifecycle.infer(&prompt, &self.config.generation)?;
        let inference_time = started.elapsed();
        record.inference_duration = Some(inference_time);
        record.memory_after_mb = Some(self.memory.current_usage()?);

        let answer = completion
            .first_text()
            .ok_or_else(|| SessionError::Inference("o modelo não retornou nenhuma escolha".to_string()))?
            .trim()
            .to_string();

        Ok(AttemptSuccess {
            answer,
            inference_time,
            memory_used,
        })
    }

    fn finish_session(&self, log: &SessionLog, session_id: &str, started: Instant, separator: char) {
        log.write(&format!("Fim da sessão: {session_id}"));
        log.write(&format!(
            "Tempo total da sessão: {}",
            format_duration(started.elapsed())
        ));
        log.write(&self.memory_line("Uso de memória final"));
        log.write(&separator.to_string().repeat(SEPARATOR_WIDTH));
        self.memory.reclaim();
    }

    fn memory_line(&self, label: &str) -> String {
        match self.memory.current_usage() {
            Ok(mb) => format!("{label}: {mb:.2} MB"),
            Err(e) => format!("{label}: indisponível ({e})"),
        }
    }
}
