/// 检测工作线程
///
/// `Orchestrator` 独占一个线程, 同一时刻最多一帧在处理:
/// - `submit` 不阻塞, 线程忙时直接丢弃新帧 (返回 false), 不排队
/// - 模式切换/清空通过控制通道送达, 在两帧之间由工作线程执行
/// - 结果通过结果通道送出
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{select, Receiver, Sender};
use image::DynamicImage;
use log::{debug, error, info, warn};

use crate::{DetectionResult, Orchestrator, ViolationMode};

/// 控制命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    SetMode(ViolationMode),
    /// 清空扶手序列
    Reset,
}

pub struct FrameWorker {
    frames: Option<Sender<DynamicImage>>,
    control: Sender<WorkerCommand>,
    results: Receiver<DetectionResult>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<Orchestrator>>,
}

impl FrameWorker {
    /// 启动工作线程
    pub fn spawn(orchestrator: Orchestrator) -> Result<Self> {
        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<DynamicImage>(1);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let busy = Arc::new(AtomicBool::new(false));

        let flag = busy.clone();
        let handle = thread::Builder::new()
            .name("safety-detector".to_string())
            .spawn(move || run(orchestrator, frame_rx, control_rx, result_tx, flag))?;

        Ok(Self {
            frames: Some(frame_tx),
            control: control_tx,
            results: result_rx,
            busy,
            handle: Some(handle),
        })
    }

    /// 提交一帧, 已有帧在处理时丢弃并返回 false
    pub fn submit(&self, frame: DynamicImage) -> bool {
        let Some(frames) = &self.frames else {
            return false;
        };
        if !self.is_alive() {
            warn!("⚠️ 检测线程已退出, 丢弃一帧");
            return false;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("检测线程忙, 丢弃一帧");
            return false;
        }
        if frames.try_send(frame).is_err() {
            self.busy.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// 工作线程仍在运行 (panic 后为 false)
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_mode(&self, mode: ViolationMode) -> Result<()> {
        self.send(WorkerCommand::SetMode(mode))
    }

    pub fn reset(&self) -> Result<()> {
        self.send(WorkerCommand::Reset)
    }

    fn send(&self, cmd: WorkerCommand) -> Result<()> {
        self.control
            .send(cmd)
            .map_err(|_| anyhow!("Detector thread has stopped"))
    }

    /// 结果通道
    pub fn results(&self) -> &Receiver<DetectionResult> {
        &self.results
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<DetectionResult> {
        self.results.recv_timeout(timeout).ok()
    }

    /// 停止线程并取回 `Orchestrator`
    pub fn shutdown(mut self) -> Result<Orchestrator> {
        self.stop()
            .unwrap_or_else(|| Err(anyhow!("Detector thread already stopped")))
    }

    fn stop(&mut self) -> Option<Result<Orchestrator>> {
        // 断开帧通道, 线程在当前帧结束后退出
        self.frames.take();
        let handle = self.handle.take()?;
        Some(
            handle
                .join()
                .map_err(|_| anyhow!("Detector thread panicked")),
        )
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.stop() {
            error!("❌ {e}");
        }
    }
}

fn run(
    mut orchestrator: Orchestrator,
    frames: Receiver<DynamicImage>,
    control: Receiver<WorkerCommand>,
    results: Sender<DetectionResult>,
    busy: Arc<AtomicBool>,
) -> Orchestrator {
    info!("🔍 检测线程启动 (模式: {})", orchestrator.mode());

    loop {
        select! {
            recv(control) -> cmd => match cmd {
                Ok(cmd) => apply(&mut orchestrator, cmd),
                // 控制端只在 FrameWorker 销毁时断开
                Err(_) => break,
            },
            recv(frames) -> frame => match frame {
                Ok(frame) => {
                    // 帧之前到达的命令先执行
                    while let Ok(cmd) = control.try_recv() {
                        apply(&mut orchestrator, cmd);
                    }
                    let result = orchestrator.process(&frame);
                    busy.store(false, Ordering::Release);
                    let _ = results.send(result);
                }
                Err(_) => {
                    while let Ok(cmd) = control.try_recv() {
                        apply(&mut orchestrator, cmd);
                    }
                    break;
                }
            },
        }
    }

    info!("🛑 检测线程退出");
    orchestrator
}

fn apply(orchestrator: &mut Orchestrator, cmd: WorkerCommand) {
    match cmd {
        WorkerCommand::SetMode(mode) => orchestrator.set_mode(mode),
        WorkerCommand::Reset => orchestrator.reset(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{FailingBackend, FixedBackend};
    use crate::{InferenceBackend, PipelineConfig};
    use ndarray::{Array, ArrayD};

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// 每次推理先通知 `started`, 再等待 `gate` 放行
    struct GatedBackend {
        started: Sender<()>,
        gate: Receiver<()>,
    }

    impl InferenceBackend for GatedBackend {
        fn run(&mut self, _input: ArrayD<f32>) -> Result<ArrayD<f32>> {
            let _ = self.started.send(());
            self.gate.recv()?;
            Ok(Array::zeros((1, 56, 4)).into_dyn())
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.pose.input_size = 32;
        config.helmet.input_size = 32;
        config
    }

    fn frame() -> DynamicImage {
        DynamicImage::new_rgb8(32, 32)
    }

    fn gated_worker() -> (FrameWorker, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let pose = GatedBackend {
            started: started_tx,
            gate: gate_rx,
        };
        let orch = Orchestrator::from_backends(
            &config(),
            Box::new(pose),
            Box::new(FixedBackend::new(Array::zeros((1, 5, 4)).into_dyn())),
            Box::new(FailingBackend),
        )
        .unwrap();
        (FrameWorker::spawn(orch).unwrap(), started_rx, gate_tx)
    }

    #[test]
    fn test_drops_frames_while_busy() {
        let (worker, started, gate) = gated_worker();

        assert!(worker.submit(frame()));
        started.recv_timeout(TIMEOUT).unwrap();
        assert!(worker.is_busy());
        assert!(!worker.submit(frame()));
        assert!(!worker.submit(frame()));

        gate.send(()).unwrap();
        let result = worker.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(result.mode(), ViolationMode::Helmet);
        assert!(!worker.is_busy());

        // 被丢弃的帧不会产生结果
        assert!(worker.submit(frame()));
        started.recv_timeout(TIMEOUT).unwrap();
        gate.send(()).unwrap();
        assert!(worker.recv_timeout(TIMEOUT).is_some());
        assert!(worker.results().try_recv().is_err());

        worker.shutdown().unwrap();
    }

    #[test]
    fn test_mode_commands_apply_before_next_frame() {
        let (worker, started, gate) = gated_worker();
        worker.set_mode(ViolationMode::Handrail).unwrap();

        assert!(worker.submit(frame()));
        started.recv_timeout(TIMEOUT).unwrap();
        gate.send(()).unwrap();
        let result = worker.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(result.mode(), ViolationMode::Handrail);

        worker.reset().unwrap();
        let orch = worker.shutdown().unwrap();
        assert_eq!(orch.mode(), ViolationMode::Handrail);
        assert_eq!(orch.sequence_len(), 0);
    }

    struct PanickingBackend;

    impl InferenceBackend for PanickingBackend {
        fn run(&mut self, _input: ArrayD<f32>) -> Result<ArrayD<f32>> {
            panic!("backend crashed");
        }
    }

    #[test]
    fn test_dead_thread_rejects_frames() {
        let orch = Orchestrator::from_backends(
            &config(),
            Box::new(PanickingBackend),
            Box::new(FailingBackend),
            Box::new(FailingBackend),
        )
        .unwrap();
        let worker = FrameWorker::spawn(orch).unwrap();
        assert!(worker.is_alive());
        assert!(worker.submit(frame()));

        let start = std::time::Instant::now();
        while worker.is_alive() && start.elapsed() < TIMEOUT {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_alive());
        assert!(!worker.submit(frame()));
        assert!(worker.recv_timeout(Duration::from_millis(10)).is_none());
        assert!(worker.shutdown().is_err());
    }

    #[test]
    fn test_drop_after_panic_does_not_propagate() {
        let orch = Orchestrator::from_backends(
            &config(),
            Box::new(PanickingBackend),
            Box::new(FailingBackend),
            Box::new(FailingBackend),
        )
        .unwrap();
        let worker = FrameWorker::spawn(orch).unwrap();
        assert!(worker.submit(frame()));
        drop(worker);
    }

    #[test]
    fn test_shutdown_returns_orchestrator() {
        let orch = Orchestrator::from_backends(
            &config(),
            Box::new(FailingBackend),
            Box::new(FailingBackend),
            Box::new(FailingBackend),
        )
        .unwrap();
        let worker = FrameWorker::spawn(orch).unwrap();
        assert!(worker.submit(frame()));
        let result = worker.recv_timeout(TIMEOUT).unwrap();
        assert!(result.person_detections().is_empty());

        let orch = worker.shutdown().unwrap();
        assert_eq!(orch.mode(), ViolationMode::Helmet);
    }
}
