/// 安全违规检测 (Safety Watch)
///
/// 按顺序把图片当作连续帧送入检测流水线, 每帧输出一行 JSON 结果
///
/// 用法:
/// ```text
/// RUST_LOG=debug safety-watch --mode handrail frames/*.jpg
/// ```
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use safety_sentinel::utils::orient_frame;
use safety_sentinel::{Args, Orchestrator, OrtEP};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.pipeline_config()?;
    let ep = OrtEP::from_flags(args.trt, args.cuda, args.device_id);

    info!("🚀 安全违规检测启动");
    info!("🦴 姿态模型: {}", config.models.pose.display());
    info!("⛑️ 安全帽模型: {}", config.models.helmet.display());
    info!("🪜 楼梯安全模型: {}", config.models.stair_safety.display());
    info!("📋 检测模式: {}", config.initial_mode.display_name());

    let mut orchestrator = Orchestrator::from_config(&config, ep)?;

    for path in args.images.iter() {
        let image = match image::open(path)
            .with_context(|| format!("Failed to open image {}", path.display()))
            .and_then(|img| orient_frame(img, args.rotation))
        {
            Ok(img) => img,
            Err(e) => {
                warn!("⚠️ 跳过 {}: {e:#}", path.display());
                continue;
            }
        };

        let result = orchestrator.process(&image);
        let summary = result.summary();
        info!(
            "🖼️ {}: {} 人, 佩戴 {}, 未佩戴 {}, 扶手 {:?} ({:.1} ms)",
            path.display(),
            summary.person_count,
            summary.with_gear,
            summary.without_gear,
            result.handrail_status(),
            result.processing_time_ms()
        );
        println!("{}", serde_json::to_string(&result)?);
    }

    Ok(())
}
