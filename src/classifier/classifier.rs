use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use ndarray::{Array2, CowArray};
use ort::{
    Environment, Session, SessionBuilder, Value,
    GraphOptimizationLevel, LoggingLevel,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::processor::{features, FeatureVector, TerminatedFlow};
use crate::types::Verdict;

pub const DEFAULT_INPUT_WIDTH: usize = 100;
/// Single-output models: probability above this is an attack.
pub const ATTACK_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct Inference {
    pub verdict: Verdict,
    /// Predicted class index. Binary single-output models report 0 or 1.
    pub class: usize,
    pub probs: Vec<f32>,
    pub micros: u128,
}

/// Anything that can score a prepared input row.
pub trait Classifier {
    fn predict(&mut self, input: &[f32]) -> Result<Inference>;
}

/// Used when no model is configured: every flow is exported unscored.
pub struct NoModel;

impl Classifier for NoModel {
    fn predict(&mut self, _input: &[f32]) -> Result<Inference> {
        Ok(Inference { verdict: Verdict::Unscored, class: 0, probs: Vec::new(), micros: 0 })
    }
}

/// Maps raw model output to a verdict. Two or more outputs are class
/// probabilities (class 0 is benign), a single output is an attack score.
pub fn decode_output(probs: &[f32]) -> Result<(usize, Verdict)> {
    match probs.len() {
        0 => Err(anyhow!("Empty probability vector")),
        1 if probs[0] > ATTACK_THRESHOLD => Ok((1, Verdict::Malicious)),
        1 => Ok((0, Verdict::Benign)),
        _ => {
            let pred = probs.iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(idx, _)| idx)
                .ok_or_else(|| anyhow!("Empty probability vector"))?;
            Ok((pred, if pred == 0 { Verdict::Benign } else { Verdict::Malicious }))
        }
    }
}

/// Per-feature standardization coefficients: `(x - mean[i]) / scale[i]`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Scaler {
    pub mean: Vec<f32>,
    pub scale: Vec<f32>,
}

impl Scaler {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read scaler {}", path.display()))?;
        let scaler: Scaler = serde_json::from_str(&s)
            .with_context(|| format!("parse scaler {}", path.display()))?;
        if scaler.mean.len() != scaler.scale.len() {
            bail!("scaler has {} means but {} scales", scaler.mean.len(), scaler.scale.len());
        }
        Ok(scaler)
    }

    fn apply(&self, index: usize, value: f32) -> f32 {
        match (self.mean.get(index), self.scale.get(index)) {
            (Some(&mean), Some(&scale)) if scale != 0.0 => (value - mean) / scale,
            _ => value,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClassMap {
    num_classes: usize,
    id_to_label: HashMap<String, String>,
}

// Maps the class_map.json written at training time to a vector of class names
pub fn load_label_vector<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read class map {}", path.display()))?;
    let m: ClassMap = serde_json::from_str(&s)
        .with_context(|| format!("parse class map {}", path.display()))?;
    let mut labels = vec!["Unknown".to_string(); m.num_classes.max(1)];
    for (k, v) in m.id_to_label {
        if let Ok(idx) = k.parse::<usize>() {
            if idx < labels.len() { labels[idx] = v; }
        }
    }
    Ok(labels)
}

/// Turns a feature vector into the fixed-width model input.
#[derive(Debug, Clone)]
pub struct InputShaper {
    pub width: usize,
    pub scaler: Option<Scaler>,
}

impl Default for InputShaper {
    fn default() -> Self {
        Self { width: DEFAULT_INPUT_WIDTH, scaler: None }
    }
}

impl InputShaper {
    pub fn prepare(&self, features: &FeatureVector) -> Vec<f32> {
        let mut input: Vec<f32> = features
            .to_f32()
            .into_iter()
            .enumerate()
            .map(|(i, v)| match &self.scaler {
                Some(scaler) => scaler.apply(i, v),
                None => v,
            })
            .collect();
        // Normalization first, then zero padding or truncation from the end.
        input.resize(self.width, 0.0);
        input
    }
}

pub struct NidsModel {
    #[allow(dead_code)]
    environment: Arc<Environment>,
    session: Session,
}

impl NidsModel {
    pub fn load(model_path: &Path) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("flowgate-model")
                .with_log_level(LoggingLevel::Warning)
                .build()
                .context("Failed to create ONNX environment")?
        );

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .with_model_from_file(model_path)
            .with_context(|| format!("Failed to load model from {}", model_path.display()))?;

        Ok(Self { environment, session })
    }
}

impl Classifier for NidsModel {
    fn predict(&mut self, input: &[f32]) -> Result<Inference> {
        let array = Array2::from_shape_vec((1, input.len()), input.to_vec())
            .context("Failed to create input array")?;
        let cow = CowArray::from(array.into_dyn());

        let t0 = Instant::now();

        let tensor = Value::from_array(self.session.allocator(), &cow)
            .context("Failed to create input tensor")?;

        let outputs = self.session.run(vec![tensor])
            .context("Failed to run model")?;

        let dt = t0.elapsed().as_micros();

        let probs = outputs.iter()
            .find_map(|o| o.try_extract::<f32>().ok())
            .map(|t| t.view().iter().copied().collect::<Vec<f32>>())
            .ok_or_else(|| anyhow!("No probability output from model"))?;

        let (class, verdict) = decode_output(&probs)?;
        Ok(Inference { verdict, class, probs, micros: dt })
    }
}

/// A terminated flow with its features and verdict.
#[derive(Debug, Clone)]
pub struct ClassifiedFlow {
    pub flow: TerminatedFlow,
    pub features: FeatureVector,
    pub inference: Option<Inference>,
}

impl ClassifiedFlow {
    pub fn verdict(&self) -> Verdict {
        self.inference.as_ref().map_or(Verdict::Indeterminate, |i| i.verdict)
    }

    /// Text of the Label column. Malicious flows take their class name when
    /// `class_names` covers the predicted index; unscored flows take `unscored`.
    pub fn label(&self, class_names: &[String], unscored: &str) -> String {
        match (self.verdict(), &self.inference) {
            (Verdict::Unscored, _) => unscored.to_string(),
            (Verdict::Malicious, Some(inf)) => class_names
                .get(inf.class)
                .cloned()
                .unwrap_or_else(|| Verdict::Malicious.label().to_string()),
            (v, _) => v.label().to_string(),
        }
    }
}

pub struct ClassifierHandles {
    pub tx: Sender<TerminatedFlow>,
    pub rx: Receiver<ClassifiedFlow>,
    pub thread: JoinHandle<()>,
}

fn classify_flow<C: Classifier>(
    model: &mut C,
    shaper: &InputShaper,
    flow: TerminatedFlow,
) -> ClassifiedFlow {
    let features = features::extract(&flow.record);
    let input = shaper.prepare(&features);

    let inference = match model.predict(&input) {
        Ok(inference) => {
            debug!(
                flow = %flow.record.key,
                verdict = %inference.verdict,
                micros = inference.micros as u64,
                "flow scored"
            );
            Some(inference)
        }
        Err(e) => {
            error!(flow = %flow.record.key, "Classification error: {e:?}");
            None
        }
    };

    ClassifiedFlow { flow, features, inference }
}

/// Starts the classifier thread. The model is built inside the thread by
/// `load`; a load failure is returned here before any flow is accepted.
/// The thread exits once every sender of `tx` is dropped.
pub fn spawn_classifier<C, F>(load: F, shaper: InputShaper) -> Result<ClassifierHandles>
where
    C: Classifier,
    F: FnOnce() -> Result<C> + Send + 'static,
{
    let (tx_in, rx_in) = unbounded::<TerminatedFlow>();
    let (tx_out, rx_out) = unbounded::<ClassifiedFlow>();
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

    let thread = thread::spawn(move || {
        let mut model = match load() {
            Ok(m) => {
                let _ = ready_tx.send(Ok(()));
                m
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        info!("Classifier thread ready, waiting for flows");

        while let Ok(flow) = rx_in.recv() {
            let classified = classify_flow(&mut model, &shaper, flow);
            if tx_out.send(classified).is_err() {
                // Output channel closed, exit gracefully
                break;
            }
        }

        info!("Classifier thread exiting (channel closed)");
    });

    ready_rx
        .recv()
        .map_err(|_| anyhow!("classifier thread exited during model load"))?
        .context("Failed to load classifier model")?;

    Ok(ClassifierHandles { tx: tx_in, rx: rx_out, thread })
}
