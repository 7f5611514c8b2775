mod common;

use std::{sync::Arc, time::Duration};

use actix_web::{
    App,
    http::{StatusCode, header},
    test, web,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::Value;
use vision::{
    ImageCodec, NativeCodec, Pipeline, PipelineStage, PixelBuffer, Stage, StageCatalog,
    StageError, StageOutput, StageParams,
};
use vision_api::{
    AppState, Dispatcher, ErrorKind, RequestOptions, WorkerPool, configure,
    context::RequestContext,
};

use common::{CountingCodec, black_png, dispatcher_with, pool_config, settings, state};

fn post_png(uri: &str, body: Vec<u8>) -> test::TestRequest {
    test::TestRequest::post()
        .uri(uri)
        .insert_header((header::CONTENT_TYPE, "image/png"))
        .set_payload(body)
}

#[actix_web::test]
async fn black_png_round_trips_through_identity_pipeline() {
    let state = state("", pool_config(2, 2), Duration::from_secs(5));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    let resp = test::call_service(&app, post_png("/process", black_png(10, 10)).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["width"], 10);
    assert_eq!(body["height"], 10);
    assert_eq!(body["format"], "png");
    assert!(body["terminated_by"].is_null());

    let encoded = STANDARD.decode(body["image"].as_str().unwrap()).unwrap();
    let decoded = NativeCodec::default().decode(&encoded, "image/png").unwrap();
    assert_eq!((decoded.width(), decoded.height()), (10, 10));
    assert!(decoded.data().iter().all(|&v| v == 0));
}

#[actix_web::test]
async fn image_output_mode_returns_encoded_bytes() {
    let state = state("invert", pool_config(1, 1), Duration::from_secs(5));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    let resp = test::call_service(
        &app,
        post_png("/process?output=image&format=bmp", black_png(4, 3)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "image/bmp");
    let disposition = resp.headers().get(header::CONTENT_DISPOSITION).unwrap();
    assert!(disposition.to_str().unwrap().ends_with(".bmp\""));
    let bytes = test::read_body(resp).await;
    let decoded = NativeCodec::default().decode(&bytes, "image/bmp").unwrap();
    assert_eq!((decoded.width(), decoded.height()), (4, 3));
    assert!(decoded.data().iter().all(|&v| v == 255));
}

#[actix_web::test]
async fn text_declared_as_image_is_unsupported() {
    let state = state("", pool_config(1, 1), Duration::from_secs(5));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    let req = test::TestRequest::post()
        .uri("/process")
        .insert_header((header::CONTENT_TYPE, "image/png"))
        .insert_header(("x-file-name", "notes.txt"))
        .set_payload("this is plain text, not a picture")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "unsupported_format");

    let req = test::TestRequest::post()
        .uri("/process")
        .insert_header((header::CONTENT_TYPE, "text/plain"))
        .set_payload("hello")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "unsupported_format");
    assert_eq!(body["error"]["phase"], "received");
}

#[actix_web::test]
async fn truncated_png_is_corrupt_input() {
    let state = state("", pool_config(1, 1), Duration::from_secs(5));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    let mut png = black_png(10, 10);
    png.truncate(30);
    let resp = test::call_service(&app, post_png("/process", png).to_request()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "corrupt_input");
    assert_eq!(body["error"]["phase"], "decoding");
}

#[actix_web::test]
async fn oversized_upload_never_reaches_the_codec() {
    let codec = Arc::new(CountingCodec::default());
    let mut limits = settings(Duration::from_secs(5));
    limits.max_upload_bytes = 512;
    let dispatcher =
        dispatcher_with(Pipeline::identity(), codec.clone(), pool_config(1, 1), limits);
    let state = web::Data::new(AppState::new(dispatcher));
    let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

    let resp = test::call_service(&app, post_png("/process", vec![0u8; 1024]).to_request()).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "payload_too_large");

    // Direct callers are held to the same limit.
    let ctx = RequestContext::new();
    let upload = vision_api::UploadedImage {
        bytes: vec![0u8; 1024].into(),
        content_type: "image/png".into(),
        file_name: None,
    };
    let err = state
        .dispatcher
        .dispatch(&ctx, upload, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PayloadTooLarge);
    assert_eq!(codec.decodes(), 0);

    let resp = test::call_service(&app, post_png("/process", black_png(2, 2)).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(codec.decodes(), 1);
}

#[actix_web::test]
async fn stage_failure_returns_only_the_error() {
    let state = state(
        "grayscale;fail:message=sensor offline;measure",
        pool_config(1, 1),
        Duration::from_secs(5),
    );
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    let resp = test::call_service(&app, post_png("/process", black_png(10, 10)).to_request()).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = test::read_body_json(resp).await;
    let object = body.as_object().unwrap();
    assert_eq!(object.len(), 1);
    assert_eq!(body["error"]["code"], "stage_failure");
    assert_eq!(body["error"]["phase"], "processing");
    assert!(body["error"]["message"].as_str().unwrap().contains("sensor offline"));

    // The process keeps serving; a disarmed fault lets the next request through.
    let resp = test::call_service(
        &app,
        post_png("/process?fail.enabled=false", black_png(10, 10)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["measurements"]["measure.mean_luma"], 0.0);
}

#[derive(Debug)]
struct Explode;

impl Stage for Explode {
    fn kind(&self) -> &'static str {
        "explode"
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        if params.get_or("armed", true)? {
            panic!("native library aborted");
        }
        Ok(StageOutput::next(input.clone()))
    }
}

#[actix_web::test]
async fn panicking_stage_is_an_internal_error_and_the_worker_survives() {
    let stage = PipelineStage::new("explode", Arc::new(Explode), StageParams::new()).unwrap();
    let dispatcher = dispatcher_with(
        Pipeline::new(vec![stage]).unwrap(),
        Arc::new(NativeCodec::default()),
        pool_config(1, 0),
        settings(Duration::from_secs(5)),
    );
    let state = web::Data::new(AppState::new(dispatcher));
    let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

    let resp = test::call_service(&app, post_png("/process", black_png(3, 3)).to_request()).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "internal_error");

    let resp = test::call_service(
        &app,
        post_png("/process?explode.armed=false", black_png(3, 3)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(state.dispatcher.pool().status().alive_workers, 1);
}

#[actix_web::test]
async fn faulty_requests_do_not_disturb_healthy_ones_on_the_same_workers() {
    // One worker serves every pipeline, so each failure lands on the thread the
    // next healthy request needs.
    let pool = Arc::new(WorkerPool::new(pool_config(1, 1)).unwrap());
    let app_for = |pipeline: Pipeline| {
        web::Data::new(AppState::new(Dispatcher::new(
            pipeline,
            Arc::new(NativeCodec::default()),
            pool.clone(),
            settings(Duration::from_secs(5)),
        )))
    };
    let catalog = StageCatalog::builtin();
    let failing =
        app_for(Pipeline::from_stage_list(&catalog, "fail:message=sensor offline").unwrap());
    let explode = PipelineStage::new("explode", Arc::new(Explode), StageParams::new()).unwrap();
    let panicking = app_for(Pipeline::new(vec![explode]).unwrap());
    let healthy = app_for(Pipeline::from_stage_list(&catalog, "grayscale;measure").unwrap());

    let failing = test::init_service(App::new().app_data(failing).configure(configure)).await;
    let panicking = test::init_service(App::new().app_data(panicking).configure(configure)).await;
    let healthy = test::init_service(App::new().app_data(healthy).configure(configure)).await;

    for _ in 0..2 {
        let resp =
            test::call_service(&failing, post_png("/process", black_png(4, 4)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "stage_failure");

        let resp =
            test::call_service(&healthy, post_png("/process", black_png(4, 4)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["measurements"]["measure.mean_luma"], 0.0);

        let resp =
            test::call_service(&panicking, post_png("/process", black_png(4, 4)).to_request())
                .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "internal_error");

        let resp =
            test::call_service(&healthy, post_png("/process", black_png(4, 4)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let status = pool.status();
    assert_eq!(status.alive_workers, 1);
    assert!(status.accepting);
}

#[actix_web::test]
async fn slow_stage_times_out_with_the_interrupted_phase() {
    let state = state("delay:ms=500", pool_config(1, 1), Duration::from_millis(100));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    let resp = test::call_service(&app, post_png("/process", black_png(4, 4)).to_request()).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "timeout");
    assert_eq!(body["error"]["phase"], "processing");
}

#[actix_web::test]
async fn bad_overrides_are_rejected_before_queueing() {
    let state = state("blur:sigma=1", pool_config(1, 1), Duration::from_secs(5));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    for uri in [
        "/process?sharpen.amount=2",
        "/process?blur.sigma=-1",
        "/process?blur.sigma=wide",
        "/process?output=xml",
    ] {
        let resp = test::call_service(&app, post_png(uri, black_png(4, 4)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "invalid_parameters", "{uri}");
    }
}

#[actix_web::test]
async fn oversized_resize_and_delay_overrides_are_refused() {
    let state = state("resize:max_side=8;delay:ms=1", pool_config(1, 1), Duration::from_secs(5));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    for uri in [
        "/process?resize.max_side=4000000000",
        "/process?delay.ms=18446744073709551615",
        "/process?delay.ms=3600000",
    ] {
        let resp = test::call_service(&app, post_png(uri, black_png(2, 2)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "invalid_parameters", "{uri}");
        assert_eq!(body["error"]["phase"], "received", "{uri}");
    }

    // Within the side cap but past the pixel cap once the aspect ratio is known.
    let resp = test::call_service(
        &app,
        post_png("/process?resize.max_side=8192", black_png(2, 2)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "invalid_parameters");
    assert_eq!(body["error"]["phase"], "processing");

    let resp = test::call_service(&app, post_png("/process", black_png(2, 2)).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!((body["width"].as_u64(), body["height"].as_u64()), (Some(8), Some(8)));
}

#[actix_web::test]
async fn detection_without_objects_terminates_without_an_image() {
    let state = state("grayscale;detect;invert", pool_config(1, 1), Duration::from_secs(5));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    let resp = test::call_service(
        &app,
        post_png("/process?output=image", black_png(10, 10)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let body: Value = test::read_body_json(resp).await;
    assert!(body["image"].is_null());
    assert_eq!(body["terminated_by"]["stage"], "detect");
    assert_eq!(body["terminated_by"]["reason"], "no_object_detected");
    assert_eq!(body["stages"].as_array().unwrap().len(), 2);
}

#[actix_web::test]
async fn health_endpoints_and_stage_listing() {
    let state = state("grayscale;blur:sigma=2", pool_config(2, 1), Duration::from_secs(5));
    let app = test::init_service(App::new().app_data(state).configure(configure)).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pool"]["workers"], 2);
    assert_eq!(body["pool"]["capacity"], 3);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/live").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/stages").to_request()).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["stages"][0]["name"], "grayscale");
    assert_eq!(body["stages"][1]["kind"], "blur");
    assert_eq!(body["stages"][1]["defaults"]["sigma"], "2");
}
