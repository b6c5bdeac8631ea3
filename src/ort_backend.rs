// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use log::info;
use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::Session;
use ort::value::Tensor;

use crate::InferenceBackend;

/// Execution Provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrtEP {
    #[default]
    CPU,
    CUDA(i32),
    Trt(i32),
}

impl OrtEP {
    /// 根据命令行开关选择 EP (TensorRT 优先)
    pub fn from_flags(trt: bool, cuda: bool, device_id: i32) -> Self {
        if trt {
            OrtEP::Trt(device_id)
        } else if cuda {
            OrtEP::CUDA(device_id)
        } else {
            OrtEP::CPU
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: PathBuf,
    pub ep: OrtEP,
}

/// ONNX Runtime 会话, 单输入单输出
pub struct OrtBackend {
    session: Session,
    name: String,
}

impl OrtBackend {
    pub fn build(config: OrtConfig) -> Result<Self> {
        let ep = match config.ep {
            OrtEP::CPU => CPUExecutionProvider::default().build(),
            OrtEP::CUDA(id) => CUDAExecutionProvider::default().with_device_id(id).build(),
            OrtEP::Trt(id) => TensorRTExecutionProvider::default()
                .with_device_id(id)
                .build(),
        };

        let session = Session::builder()
            .map_err(|e| anyhow!("{e}"))?
            .with_execution_providers([ep])
            .map_err(|e| anyhow!("{e}"))?
            .commit_from_file(&config.f)
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("Failed to load ONNX model {}", config.f.display()))?;

        let name = config
            .f
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        info!("✅ ONNX 模型: {} ({:?})", config.f.display(), config.ep);

        Ok(Self { session, name })
    }
}

impl InferenceBackend for OrtBackend {
    fn run(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_array((shape, data)).map_err(|e| anyhow!("{e}"))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| anyhow!("{e}"))?;
        let (_, value) = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("Model produced no outputs"))?;
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("{e}"))?;

        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        Ok(ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
