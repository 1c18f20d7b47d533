//! Multi-horizon regressor runtime and its JSON artifact.
//!
//! The shipped runtime is a ridge-regularized linear model with one
//! output per horizon hour, fitted in closed form on standardized
//! features.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::{FeatureRow, FeatureSchema};

const MIN_FEATURE_STD: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact not found at {0}")]
    ArtifactMissing(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model artifact JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model shape mismatch for {what}: expected {expected}, got {actual}")]
    Shape {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("model was fitted on feature schema {actual}, running schema is {expected}")]
    SchemaMismatch { expected: String, actual: String },
    #[error("model predicts {actual} horizons, configuration expects {expected}")]
    HorizonMismatch { expected: u32, actual: u32 },
    #[error("not enough training rows: {available} usable, need {min_train} train + {min_test} test")]
    NotEnoughRows {
        available: usize,
        min_train: usize,
        min_test: usize,
    },
    #[error("normal equations are not positive definite (pivot {pivot})")]
    Singular { pivot: usize },
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("invalid training config: {0}")]
    InvalidConfig(String),
}

/// Opaque feature-vector to H-vector predictor.
pub trait ModelRuntime {
    fn horizon_hours(&self) -> u32;
    fn schema_fingerprint(&self) -> &str;
    fn predict(&self, features: &[f64]) -> Result<Vec<f64>, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub train_rows: usize,
    pub test_rows: usize,
    pub mae_all_horizons: f64,
    pub mae_per_horizon: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_name: String,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub feature_columns: Vec<String>,
    pub horizon_hours: u32,
    pub intercepts: Vec<f64>,
    /// `weights[h - 1][j]` multiplies feature column `j` for horizon `h`.
    pub weights: Vec<Vec<f64>>,
    #[serde(default)]
    pub trained_at: Option<String>,
    #[serde(default)]
    pub metrics: Option<TrainingMetrics>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    artifact: ModelArtifact,
}

impl LinearModel {
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelError> {
        let horizon = artifact.horizon_hours as usize;
        let width = artifact.feature_columns.len();
        if artifact.intercepts.len() != horizon {
            return Err(ModelError::Shape {
                what: "intercepts",
                expected: horizon,
                actual: artifact.intercepts.len(),
            });
        }
        if artifact.weights.len() != horizon {
            return Err(ModelError::Shape {
                what: "weights",
                expected: horizon,
                actual: artifact.weights.len(),
            });
        }
        for row in &artifact.weights {
            if row.len() != width {
                return Err(ModelError::Shape {
                    what: "weights row",
                    expected: width,
                    actual: row.len(),
                });
            }
        }
        let all_finite = artifact
            .intercepts
            .iter()
            .chain(artifact.weights.iter().flatten())
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(ModelError::NonFinite("model coefficients"));
        }
        Ok(Self { artifact })
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn into_artifact(self) -> ModelArtifact {
        self.artifact
    }
}

impl ModelRuntime for LinearModel {
    fn horizon_hours(&self) -> u32 {
        self.artifact.horizon_hours
    }

    fn schema_fingerprint(&self) -> &str {
        &self.artifact.schema_fingerprint
    }

    fn predict(&self, features: &[f64]) -> Result<Vec<f64>, ModelError> {
        let width = self.artifact.feature_columns.len();
        if features.len() != width {
            return Err(ModelError::Shape {
                what: "feature vector",
                expected: width,
                actual: features.len(),
            });
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("feature vector"));
        }

        Ok(self
            .artifact
            .weights
            .iter()
            .zip(&self.artifact.intercepts)
            .map(|(weights, intercept)| {
                intercept + weights.iter().zip(features).map(|(w, x)| w * x).sum::<f64>()
            })
            .collect())
    }
}

/// Fails unless `model` was fitted on exactly `schema` (columns, version and horizon).
pub fn ensure_runtime_compatible(
    model: &dyn ModelRuntime,
    schema: &FeatureSchema,
) -> Result<(), ModelError> {
    if model.schema_fingerprint() != schema.fingerprint {
        return Err(ModelError::SchemaMismatch {
            expected: schema.fingerprint.clone(),
            actual: model.schema_fingerprint().to_string(),
        });
    }
    if model.horizon_hours() != schema.horizon_hours {
        return Err(ModelError::HorizonMismatch {
            expected: schema.horizon_hours,
            actual: model.horizon_hours(),
        });
    }
    Ok(())
}

pub fn load_model_artifact(path: &Path) -> Result<LinearModel, ModelError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ModelError::ArtifactMissing(path.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };
    let artifact: ModelArtifact = serde_json::from_slice(&bytes)?;
    let model = LinearModel::from_artifact(artifact)?;

    info!(
        component = "model",
        event = "model.artifact.loaded",
        path = %path.display(),
        model_name = %model.artifact.model_name,
        horizon_hours = model.artifact.horizon_hours,
        fingerprint = %model.artifact.schema_fingerprint
    );
    Ok(model)
}

/// Writes `<path>.tmp` then renames over `path`.
pub fn save_model_artifact(path: &Path, artifact: &ModelArtifact) -> Result<(), ModelError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ModelError::InvalidConfig(format!("invalid model path: {}", path.display())))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let bytes = serde_json::to_vec_pretty(artifact)?;
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    info!(
        component = "model",
        event = "model.artifact.saved",
        path = %path.display(),
        model_name = %artifact.model_name,
        bytes = bytes.len()
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub model_name: String,
    pub ridge_alpha: f64,
    /// Leading (oldest) share of rows used for fitting; the rest is held out.
    pub train_fraction: f64,
    pub min_train_rows: usize,
    pub min_test_rows: usize,
}

impl TrainConfig {
    pub fn for_horizon(horizon_hours: u32) -> Self {
        Self {
            model_name: format!("linear_pm25_next{horizon_hours}h"),
            ridge_alpha: 1.0,
            train_fraction: 0.8,
            min_train_rows: 10,
            min_test_rows: 2,
        }
    }
}

/// Fits one ridge output per horizon on the oldest `train_fraction` of
/// `rows` and reports MAE on the remainder.
///
/// Rows must be trainable (complete features and targets) and sorted by
/// instant; rows that are not are skipped.
pub fn train_linear_model(
    schema: &FeatureSchema,
    rows: &[FeatureRow],
    cfg: &TrainConfig,
) -> Result<(LinearModel, TrainingMetrics), ModelError> {
    if cfg.ridge_alpha.is_nan() || cfg.ridge_alpha < 0.0 {
        return Err(ModelError::InvalidConfig(format!(
            "ridge_alpha must be >= 0, got {}",
            cfg.ridge_alpha
        )));
    }
    if cfg.train_fraction.is_nan() || cfg.train_fraction <= 0.0 || cfg.train_fraction >= 1.0 {
        return Err(ModelError::InvalidConfig(format!(
            "train_fraction must be in (0, 1), got {}",
            cfg.train_fraction
        )));
    }

    let mut samples: Vec<(Vec<f64>, Vec<f64>)> = rows
        .iter()
        .filter(|row| row.schema_fingerprint == schema.fingerprint)
        .filter_map(|row| Some((row.feature_vector()?, row.target_vector()?)))
        .filter(|(x, y)| x.len() == schema.columns.len() && y.len() == schema.horizon_hours as usize)
        .collect();

    let split = (samples.len() as f64 * cfg.train_fraction) as usize;
    if split < cfg.min_train_rows || samples.len() - split < cfg.min_test_rows {
        return Err(ModelError::NotEnoughRows {
            available: samples.len(),
            min_train: cfg.min_train_rows,
            min_test: cfg.min_test_rows,
        });
    }
    let test = samples.split_off(split);
    let train = samples;

    let (intercepts, weights) = fit_ridge(&train, schema.columns.len(), cfg.ridge_alpha)?;
    let model = LinearModel::from_artifact(ModelArtifact {
        model_name: cfg.model_name.clone(),
        schema_version: schema.version,
        schema_fingerprint: schema.fingerprint.clone(),
        feature_columns: schema.column_names(),
        horizon_hours: schema.horizon_hours,
        intercepts,
        weights,
        trained_at: None,
        metrics: None,
    })?;

    let horizon = schema.horizon_hours as usize;
    let mut abs_err = vec![0.0; horizon];
    for (x, y) in &test {
        let predicted = model.predict(x)?;
        for (h, (p, actual)) in predicted.iter().zip(y).enumerate() {
            abs_err[h] += (p - actual).abs();
        }
    }
    let mae_per_horizon: Vec<f64> = abs_err.iter().map(|e| e / test.len() as f64).collect();
    let mae_all_horizons = mae_per_horizon.iter().sum::<f64>() / horizon.max(1) as f64;

    let metrics = TrainingMetrics {
        train_rows: train.len(),
        test_rows: test.len(),
        mae_all_horizons,
        mae_per_horizon,
    };

    info!(
        component = "model",
        event = "model.train.finish",
        model_name = %cfg.model_name,
        train_rows = metrics.train_rows,
        test_rows = metrics.test_rows,
        mae_all_horizons = metrics.mae_all_horizons
    );

    Ok((model, metrics))
}

/// Closed-form ridge on standardized features: (XᵀX + αI) B = XᵀY.
fn fit_ridge(
    samples: &[(Vec<f64>, Vec<f64>)],
    width: usize,
    alpha: f64,
) -> Result<(Vec<f64>, Vec<Vec<f64>>), ModelError> {
    let rows = samples.len();
    let outputs = samples.first().map(|(_, y)| y.len()).unwrap_or(0);

    let x = Array2::from_shape_vec(
        (rows, width),
        samples.iter().flat_map(|(x, _)| x.iter().copied()).collect(),
    )
    .map_err(|_| ModelError::Shape {
        what: "training features",
        expected: rows * width,
        actual: samples.iter().map(|(x, _)| x.len()).sum(),
    })?;
    let y = Array2::from_shape_vec(
        (rows, outputs),
        samples.iter().flat_map(|(_, y)| y.iter().copied()).collect(),
    )
    .map_err(|_| ModelError::Shape {
        what: "training targets",
        expected: rows * outputs,
        actual: samples.iter().map(|(_, y)| y.len()).sum(),
    })?;

    let empty = || ModelError::NotEnoughRows {
        available: 0,
        min_train: 1,
        min_test: 0,
    };
    let x_mean = x.mean_axis(Axis(0)).ok_or_else(empty)?;
    let y_mean = y.mean_axis(Axis(0)).ok_or_else(empty)?;
    let x_std = x
        .std_axis(Axis(0), 0.0)
        .mapv(|s| if s < MIN_FEATURE_STD { 1.0 } else { s });

    let z = (&x - &x_mean) / &x_std;
    let y_centered = &y - &y_mean;

    let mut xtx = z.t().dot(&z);
    for i in 0..width {
        xtx[[i, i]] += alpha;
    }
    let xty = z.t().dot(&y_centered);

    let l = cholesky(&xtx)?;
    let mut intercepts = Vec::with_capacity(outputs);
    let mut weights = Vec::with_capacity(outputs);
    for (k, rhs) in xty.columns().into_iter().enumerate() {
        let beta = cholesky_solve(&l, rhs);
        let w = &beta / &x_std;
        intercepts.push(y_mean[k] - x_mean.dot(&w));
        weights.push(w.to_vec());
    }
    Ok((intercepts, weights))
}

fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 || !diag.is_finite() {
                    return Err(ModelError::Singular { pivot: i });
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Forward then backward substitution against `L Lᵀ`.
fn cholesky_solve(l: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let sum: f64 = (0..i).map(|j| l[[i, j]] * z[j]).sum();
        z[i] = (b[i] - sum) / l[[i, i]];
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|j| l[[j, i]] * x[j]).sum();
        x[i] = (z[i] - sum) / l[[i, i]];
    }
    x
}
