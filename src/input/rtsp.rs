/// RTSP主动拉流源
/// RTSP active pulling source (FFmpeg software decoding)
///
/// 解码在独立线程中进行, 解码帧经容量很小的通道交给检测线程;
/// 读取时只保留最新一帧, 实时安防画面宁可丢帧也不要积压延迟。
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{debug, error, info, warn};

use super::{Frame, StreamSource};
use crate::error::StreamError;

/// 接收缓冲: 只保留极少量帧
const RECEIVE_BUFFER_FRAMES: usize = 2;
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// 单边分辨率上限, 超出的帧视为损坏
const MAX_DIMENSION: i32 = 4096;
/// AVFrame.decode_error_flags: 缺少参考帧 | 无效比特流
const SEVERE_DECODE_ERRORS: i32 = 0x03;

/// 解码线程与读取端共享的状态, 每次打开新建一份
#[derive(Default)]
struct DecodeShared {
    stop: AtomicBool,
    width: AtomicU32,
    height: AtomicU32,
    fps_bits: AtomicU64, // f64::to_bits
}

impl DecodeShared {
    fn stopped() -> Arc<Self> {
        let shared = Self::default();
        shared.stop.store(true, Ordering::Relaxed);
        Arc::new(shared)
    }

    fn measured_fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }
}

/// FFmpeg解码过滤器: RTSP流 → RGBA帧
struct DecodeFilter {
    tx: Sender<Frame>,
    shared: Arc<DecodeShared>,
    frame_id: u64,
    count: usize,
    dropped_frames: usize,
    last: Instant,
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: ez_ffmpeg::Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<ez_ffmpeg::Frame>, String> {
        if self.shared.stop.load(Ordering::Relaxed) {
            return Err("stream released".to_string());
        }

        unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let raw = &*frame.as_ptr();
            let layout = match PlaneLayout::check(
                raw.width,
                raw.height,
                [raw.linesize[0], raw.linesize[1], raw.linesize[2]],
                raw.decode_error_flags,
            ) {
                Ok(layout) => layout,
                Err(reason) => {
                    self.dropped_frames += 1;
                    if self.dropped_frames <= 10 {
                        warn!("⚠️ 丢弃帧: {}", reason);
                    }
                    return Ok(None);
                }
            };

            let (y_plane, u_plane, v_plane) = (raw.data[0], raw.data[1], raw.data[2]);
            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let mut rgba = vec![255u8; layout.rgba_len()];
            yuv420p_to_rgba(
                y_plane,
                u_plane,
                v_plane,
                layout.y_stride,
                layout.uv_stride,
                &mut rgba,
                layout.width,
                layout.height,
            );

            self.count += 1;
            self.frame_id += 1;
            let (w, h) = (layout.width as u32, layout.height as u32);
            self.shared.width.store(w, Ordering::Relaxed);
            self.shared.height.store(h, Ordering::Relaxed);

            // 每秒统计一次解码帧率
            if self.last.elapsed().as_secs_f64() >= 1.0 {
                let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
                self.shared.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
                debug!(
                    "📺 解码统计: 解码{}帧 | 实际{:.1}fps | 丢弃{}",
                    self.count, fps, self.dropped_frames
                );
                self.last = Instant::now();
                self.count = 0;
            }

            // 通道满时直接丢弃, 读取端总会拿到较新的帧
            let _ = self.tx.try_send(Frame::new(rgba, w, h, self.frame_id));
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!("✅ 解码线程退出");
    }
}

/// 通过检查的YUV420P平面布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneLayout {
    width: usize,
    height: usize,
    y_stride: usize,
    uv_stride: usize,
}

impl PlaneLayout {
    /// 读取像素前校验帧头: 分辨率、步长 (负步长为倒置图像, 不支持)、解码错误标志
    fn check(
        width: i32,
        height: i32,
        linesize: [i32; 3],
        decode_error_flags: i32,
    ) -> Result<Self, String> {
        if width <= 0 || height <= 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(format!("非法分辨率 {}x{}", width, height));
        }
        if decode_error_flags & SEVERE_DECODE_ERRORS != 0 {
            return Err(format!("解码错误标志=0x{:02x}", decode_error_flags));
        }
        let [y_stride, u_stride, v_stride] = linesize;
        if y_stride <= 0 || u_stride <= 0 || v_stride <= 0 {
            return Err(format!("步长为负或为零 {:?}", linesize));
        }
        if u_stride != v_stride {
            return Err(format!("U/V步长不一致 {:?}", linesize));
        }
        let (width, height) = (width as usize, height as usize);
        let (y_stride, uv_stride) = (y_stride as usize, u_stride as usize);
        if y_stride < width || uv_stride < width.div_ceil(2) {
            return Err(format!("步长异常 y_stride={} uv_stride={}", y_stride, uv_stride));
        }
        Ok(Self {
            width,
            height,
            y_stride,
            uv_stride,
        })
    }

    fn rgba_len(&self) -> usize {
        self.width * self.height * 4
    }
}

/// YUV420P → RGBA (BT.601, 定点运算)
///
/// # Safety
/// 各平面指针必须覆盖 `PlaneLayout::check` 通过的布局,
/// `buffer` 长度至少为 `width * height * 4`。
#[allow(clippy::too_many_arguments)]
unsafe fn yuv420p_to_rgba(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out_idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 1] =
                (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out_idx += 4;
        }
    }
}

/// RTSP视频源
pub struct RtspSource {
    url: String,
    stream_info: String, // 日志中使用, 不含口令
    fps_hint: f64,
    input_opts: Vec<(String, String)>,
    /// 当前这一代解码线程的共享状态
    shared: Arc<DecodeShared>,
    rx: Option<Receiver<Frame>>,
    pending: Option<Frame>,
    thread: Option<JoinHandle<()>>,
    /// 已发出停止信号、尚未回收的旧解码线程
    retired: Vec<JoinHandle<()>>,
}

impl RtspSource {
    pub fn new(
        url: String,
        stream_info: String,
        fps_hint: f64,
        input_opts: Vec<(String, String)>,
    ) -> Self {
        Self {
            url,
            stream_info,
            fps_hint,
            input_opts,
            shared: DecodeShared::stopped(),
            rx: None,
            pending: None,
            thread: None,
            retired: Vec::new(),
        }
    }

    /// 尚未回收的旧解码线程数
    pub fn retired_decoders(&self) -> usize {
        self.retired.len()
    }

    fn spawn_decoder(
        &self,
        tx: Sender<Frame>,
        status: Sender<Result<(), String>>,
    ) -> std::io::Result<JoinHandle<()>> {
        let url = self.url.clone();
        let opts = self.input_opts.clone();
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("rtsp-decode".to_string())
            .spawn(move || {
                let filter = DecodeFilter {
                    tx,
                    shared,
                    frame_id: 0,
                    count: 0,
                    dropped_frames: 0,
                    last: Instant::now(),
                };

                let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
                let pipe = pipe.filter("decode", Box::new(filter));
                let out = create_null_output().add_frame_pipeline(pipe);

                let opts: HashMap<String, String> = opts.into_iter().collect();
                let input = Input::new(url).set_input_opts(opts);

                let ctx = match FfmpegContext::builder()
                    .input(input)
                    .filter_descs(["format=yuv420p"].into())
                    .output(out)
                    .build()
                {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        let _ = status.send(Err(format!("构建失败: {}", e)));
                        return;
                    }
                };

                let sch = match ctx.start() {
                    Ok(sch) => sch,
                    Err(e) => {
                        let _ = status.send(Err(format!("启动失败: {}", e)));
                        return;
                    }
                };
                let _ = status.send(Ok(()));

                let _ = sch.wait();
            })
    }
}

impl StreamSource for RtspSource {
    fn open(&mut self) -> Result<(), StreamError> {
        if self.is_open() {
            return Ok(());
        }
        self.release();
        reap_finished(&mut self.retired, &self.stream_info);
        // 新的一代: 旧线程仍持有各自已置位的停止标志
        self.shared = Arc::new(DecodeShared::default());

        let (tx, rx) = crossbeam_channel::bounded(RECEIVE_BUFFER_FRAMES);
        let (status_tx, status_rx) = crossbeam_channel::bounded(1);
        let thread = self
            .spawn_decoder(tx, status_tx)
            .map_err(|e| StreamError::unavailable(self.describe(), e))?;
        self.thread = Some(thread);

        match status_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                self.release();
                return Err(StreamError::unavailable(self.describe(), reason));
            }
            Err(_) => {
                self.release();
                return Err(StreamError::unavailable(self.describe(), "open timed out"));
            }
        }

        // 等待首帧以确定分辨率
        match rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(frame) => self.pending = Some(frame),
            Err(RecvTimeoutError::Timeout) => {
                self.release();
                return Err(StreamError::unavailable(self.describe(), "no frame received"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.release();
                return Err(StreamError::unavailable(self.describe(), "decoder exited"));
            }
        }

        self.rx = Some(rx);
        let (w, h) = self.resolution();
        info!("✅ RTSP流已连接: {} ({}x{})", self.stream_info, w, h);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        let rx = self.rx.as_ref().ok_or(StreamError::Closed)?;

        // 丢弃积压帧, 只取最新的一帧
        let mut latest = self.pending.take();
        loop {
            match rx.try_recv() {
                Ok(frame) => latest = Some(frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if latest.is_none() {
                        warn!("❌ RTSP流已断开: {}", self.stream_info);
                        self.release();
                        return Err(StreamError::Closed);
                    }
                    break;
                }
            }
        }

        latest.ok_or(StreamError::NoFrame)
    }

    fn is_open(&self) -> bool {
        self.rx.is_some()
            && self
                .thread
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false)
    }

    fn resolution(&self) -> (u32, u32) {
        (
            self.shared.width.load(Ordering::Relaxed),
            self.shared.height.load(Ordering::Relaxed),
        )
    }

    fn fps(&self) -> f64 {
        if self.fps_hint > 0.0 {
            return self.fps_hint;
        }
        let measured = self.shared.measured_fps();
        if measured > 0.0 {
            measured
        } else {
            25.0
        }
    }

    fn release(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.rx = None;
        self.pending = None;
        if let Some(thread) = self.thread.take() {
            if !thread.is_finished() {
                // 解码线程在下一帧到达时自行退出, 下次打开时回收
                debug!("🛑 解码线程收到停止信号: {}", self.stream_info);
            }
            self.retired.push(thread);
        }
        reap_finished(&mut self.retired, &self.stream_info);
    }

    fn describe(&self) -> String {
        self.stream_info.clone()
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.release();
        if !self.retired.is_empty() {
            debug!(
                "🛑 {} 个解码线程仍在退出中: {}",
                self.retired.len(),
                self.stream_info
            );
        }
    }
}

/// 回收已经退出的解码线程
fn reap_finished(threads: &mut Vec<JoinHandle<()>>, stream_info: &str) {
    let (finished, running): (Vec<_>, Vec<_>) =
        threads.drain(..).partition(|t| t.is_finished());
    *threads = running;
    for thread in finished {
        if thread.join().is_err() {
            error!("❌ 解码线程异常退出: {}", stream_info);
        }
    }
}
