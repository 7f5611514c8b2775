#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use actix_web::web::{self, Bytes};
use vision::{
    Channels, CodecError, FormatAllowList, ImageCodec, ImageFormat, NativeCodec, PixelBuffer,
    Pipeline, StageCatalog,
};
use vision_api::{AppState, DispatchSettings, Dispatcher, PoolConfig, UploadedImage, WorkerPool};

pub fn pool_config(workers: usize, queue_capacity: usize) -> PoolConfig {
    PoolConfig {
        workers,
        queue_capacity,
        queue_timeout: Duration::from_secs(5),
        stall_threshold: Duration::from_secs(60),
    }
}

pub fn settings(request_timeout: Duration) -> DispatchSettings {
    DispatchSettings {
        max_upload_bytes: 1024 * 1024,
        request_timeout,
        allowed_formats: FormatAllowList::default(),
        output_format: ImageFormat::Png,
    }
}

pub fn black_png(width: u32, height: u32) -> Vec<u8> {
    let buffer = PixelBuffer::filled(width, height, Channels::Rgb, 0).unwrap();
    NativeCodec::default().encode(&buffer, ImageFormat::Png).unwrap()
}

pub fn png_upload(width: u32, height: u32) -> UploadedImage {
    UploadedImage {
        bytes: Bytes::from(black_png(width, height)),
        content_type: "image/png".into(),
        file_name: Some("black.png".into()),
    }
}

/// Native codec that counts how often it is invoked.
#[derive(Default)]
pub struct CountingCodec {
    inner: NativeCodec,
    pub decodes: AtomicUsize,
}

impl CountingCodec {
    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl ImageCodec for CountingCodec {
    fn decode(&self, bytes: &[u8], declared: &str) -> Result<PixelBuffer, CodecError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(bytes, declared)
    }

    fn encode(&self, buffer: &PixelBuffer, format: ImageFormat) -> Result<Vec<u8>, CodecError> {
        self.inner.encode(buffer, format)
    }
}

pub fn dispatcher_with(
    pipeline: Pipeline,
    codec: Arc<dyn ImageCodec>,
    pool: PoolConfig,
    settings: DispatchSettings,
) -> Dispatcher {
    Dispatcher::new(
        pipeline,
        codec,
        Arc::new(WorkerPool::new(pool).unwrap()),
        settings,
    )
}

/// App state running the stage `list` with the native codec.
pub fn state(list: &str, pool: PoolConfig, request_timeout: Duration) -> web::Data<AppState> {
    let pipeline = Pipeline::from_stage_list(&StageCatalog::builtin(), list).unwrap();
    web::Data::new(AppState::new(dispatcher_with(
        pipeline,
        Arc::new(NativeCodec::default()),
        pool,
        settings(request_timeout),
    )))
}

/// Poll until the pool stops accepting work.
pub async fn wait_until_saturated(state: &AppState) {
    for _ in 0..200 {
        if !state.dispatcher.pool().status().accepting {
            return;
        }
        actix_web::rt::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool never saturated");
}
