//! State-machine applicator for worker nodes: interprets committed commands
//! (file uploads, trained-model registrations), owns the model registry, and
//! serves the read path (predictions, listings) for the front-end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::raft::Applicator;

const HIDDEN_UNITS: usize = 8;
const LEARNING_RATE: f64 = 0.5;

/// Commands understood by this applicator. Consensus never looks inside
/// these; they travel as opaque JSON records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Command {
    #[serde(rename = "PUT")]
    Put { filename: String, data_b64: String },
    #[serde(rename = "MODEL_TRAINED")]
    ModelTrained { model: Model },
}

impl Command {
    pub fn into_value(self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A small feed-forward network (one sigmoid hidden layer) trained with
/// plain gradient descent. The whole model rides inside the MODEL_TRAINED
/// command so every replica can serve predictions after apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: Uuid,
    pub input_dim: usize,
    pub output_dim: usize,
    hidden_weights: Vec<Vec<f64>>,
    hidden_bias: Vec<f64>,
    output_weights: Vec<Vec<f64>>,
    output_bias: Vec<f64>,
    pub trained_at: DateTime<Utc>,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl Model {
    pub fn train(inputs: &[Vec<f64>], outputs: &[Vec<f64>], epochs: usize) -> Result<Model> {
        if inputs.is_empty() {
            return Err(Error::Training("no training samples".into()));
        }
        if inputs.len() != outputs.len() {
            return Err(Error::Training(format!(
                "{} input rows but {} output rows",
                inputs.len(),
                outputs.len()
            )));
        }
        let input_dim = inputs[0].len();
        let output_dim = outputs[0].len();
        if input_dim == 0 || output_dim == 0 {
            return Err(Error::Training("empty sample row".into()));
        }
        if inputs.iter().any(|row| row.len() != input_dim)
            || outputs.iter().any(|row| row.len() != output_dim)
        {
            return Err(Error::Training("ragged sample rows".into()));
        }

        let mut rng = rand::thread_rng();
        let mut init = |cols: usize| -> Vec<f64> {
            (0..cols).map(|_| rng.gen_range(-0.5..0.5)).collect()
        };
        let mut hidden_weights: Vec<Vec<f64>> = (0..HIDDEN_UNITS).map(|_| init(input_dim)).collect();
        let mut hidden_bias = init(HIDDEN_UNITS);
        let mut output_weights: Vec<Vec<f64>> = (0..output_dim).map(|_| init(HIDDEN_UNITS)).collect();
        let mut output_bias = init(output_dim);

        let mut hidden = vec![0.0; HIDDEN_UNITS];
        let mut out = vec![0.0; output_dim];
        for _ in 0..epochs {
            for (x, y) in inputs.iter().zip(outputs) {
                for j in 0..HIDDEN_UNITS {
                    let z: f64 = hidden_weights[j].iter().zip(x).map(|(w, xi)| w * xi).sum();
                    hidden[j] = sigmoid(z + hidden_bias[j]);
                }
                for k in 0..output_dim {
                    let z: f64 = output_weights[k]
                        .iter()
                        .zip(&hidden)
                        .map(|(w, h)| w * h)
                        .sum();
                    out[k] = sigmoid(z + output_bias[k]);
                }

                let delta_out: Vec<f64> = (0..output_dim)
                    .map(|k| (out[k] - y[k]) * out[k] * (1.0 - out[k]))
                    .collect();
                let delta_hidden: Vec<f64> = (0..HIDDEN_UNITS)
                    .map(|j| {
                        let upstream: f64 = (0..output_dim)
                            .map(|k| delta_out[k] * output_weights[k][j])
                            .sum();
                        upstream * hidden[j] * (1.0 - hidden[j])
                    })
                    .collect();

                for k in 0..output_dim {
                    for j in 0..HIDDEN_UNITS {
                        output_weights[k][j] -= LEARNING_RATE * delta_out[k] * hidden[j];
                    }
                    output_bias[k] -= LEARNING_RATE * delta_out[k];
                }
                for j in 0..HIDDEN_UNITS {
                    for (i, xi) in x.iter().enumerate() {
                        hidden_weights[j][i] -= LEARNING_RATE * delta_hidden[j] * xi;
                    }
                    hidden_bias[j] -= LEARNING_RATE * delta_hidden[j];
                }
            }
        }

        Ok(Model {
            id: Uuid::new_v4(),
            input_dim,
            output_dim,
            hidden_weights,
            hidden_bias,
            output_weights,
            output_bias,
            trained_at: Utc::now(),
        })
    }

    pub fn predict(&self, input: &[f64]) -> Result<Vec<f64>> {
        if input.len() != self.input_dim {
            return Err(Error::Training(format!(
                "model expects {} inputs, got {}",
                self.input_dim,
                input.len()
            )));
        }
        let hidden: Vec<f64> = (0..self.hidden_weights.len())
            .map(|j| {
                let z: f64 = self.hidden_weights[j]
                    .iter()
                    .zip(input)
                    .map(|(w, xi)| w * xi)
                    .sum();
                sigmoid(z + self.hidden_bias[j])
            })
            .collect();
        Ok((0..self.output_dim)
            .map(|k| {
                let z: f64 = self.output_weights[k]
                    .iter()
                    .zip(&hidden)
                    .map(|(w, h)| w * h)
                    .sum();
                sigmoid(z + self.output_bias[k])
            })
            .collect())
    }
}

pub struct Worker {
    storage_dir: PathBuf,
    train_epochs: usize,
    models: RwLock<HashMap<Uuid, Model>>,
}

impl Worker {
    pub fn new(storage_dir: impl Into<PathBuf>, train_epochs: usize) -> Result<Worker> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Worker {
            storage_dir,
            train_epochs,
            models: RwLock::new(HashMap::new()),
        })
    }

    /// Training is CPU-bound; it runs off the async workers.
    pub async fn train(&self, inputs: Vec<Vec<f64>>, outputs: Vec<Vec<f64>>) -> Result<Model> {
        let epochs = self.train_epochs;
        let model = tokio::task::spawn_blocking(move || Model::train(&inputs, &outputs, epochs))
            .await
            .map_err(|_| Error::Training("training task aborted".into()))??;
        info!(model_id = %model.id, "model trained");
        Ok(model)
    }

    pub async fn predict(&self, model_id: Uuid, input: &[f64]) -> Result<Vec<f64>> {
        let models = self.models.read().await;
        let model = models.get(&model_id).ok_or(Error::UnknownModel(model_id))?;
        model.predict(input)
    }

    pub async fn list_models(&self) -> Vec<Uuid> {
        self.models.read().await.keys().copied().collect()
    }

    pub async fn register_model(&self, model: Model) {
        self.models.write().await.insert(model.id, model);
    }

    pub fn file_path(&self, filename: &str) -> Option<PathBuf> {
        sanitize_filename(filename).map(|name| self.storage_dir.join(name))
    }

    async fn store_file(&self, filename: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self
            .file_path(filename)
            .ok_or_else(|| anyhow::anyhow!("unsafe filename {filename:?}"))?;
        tokio::fs::write(&path, bytes).await?;
        info!(path = %path.display(), size = bytes.len(), "stored file");
        Ok(())
    }
}

/// Uploaded names must stay a single path component under the storage dir.
fn sanitize_filename(filename: &str) -> Option<&str> {
    let name = Path::new(filename).file_name()?.to_str()?;
    if name != filename || name == ".." {
        return None;
    }
    Some(name)
}

#[async_trait]
impl Applicator for Worker {
    async fn apply(&self, command: &Value) -> anyhow::Result<()> {
        match serde_json::from_value::<Command>(command.clone()) {
            Ok(Command::Put { filename, data_b64 }) => {
                let bytes = BASE64.decode(data_b64.as_bytes())?;
                self.store_file(&filename, &bytes).await
            }
            Ok(Command::ModelTrained { model }) => {
                info!(model_id = %model.id, "registered replicated model");
                self.register_model(model).await;
                Ok(())
            }
            Err(err) => {
                // Commands from newer software are skipped, not fatal.
                warn!(%err, "unrecognized committed command");
                Ok(())
            }
        }
    }
}
