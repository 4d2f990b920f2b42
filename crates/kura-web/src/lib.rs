//! Axum JSON API over the ingestion pipeline: upload, confirmation, data
//! listing, spreadsheet export and purge endpoints.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Form, Json, Router,
};
use kura_core::IngestOutcome;
use kura_ingest::IngestError;
use kura_pipeline::{IngestPipeline, PipelineError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "kura-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload_handler))
        .route("/confirm_upload", post(confirm_handler))
        .route("/data", get(data_handler))
        .route("/data", delete(delete_all_handler))
        .route("/data/{id}", delete(delete_one_handler))
        .route("/export", get(export_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<IngestPipeline>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("KURA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

fn is_allowed_csv(filename: &str) -> bool {
    std::path::Path::new(filename)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message.into() })),
    )
        .into_response()
}

/// Validation errors get the same user-facing messages the operators already
/// know; internal detail stays in the logs.
fn pipeline_error_response(err: PipelineError) -> Response {
    match err {
        PipelineError::Validation(validation) => {
            let message = match &validation {
                IngestError::Decode => "CSVファイルが読み取れません".to_string(),
                IngestError::EmptyInput => "CSVファイルが空、または読み取れません".to_string(),
                IngestError::MissingColumn(name) => {
                    format!("必要なカラムが見つかりません: {name}")
                }
                IngestError::InvalidFilename(_) => {
                    "ファイル名から日付を取得できません（YYYYMMDD形式で始めてください）".to_string()
                }
                IngestError::ProductMap(_) => {
                    error!(error = %validation, "product map failure during request");
                    return error_json(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "商品マッピングの読み込みに失敗しました",
                    );
                }
            };
            error_json(StatusCode::BAD_REQUEST, message)
        }
        PipelineError::UploadMissing(_) => error_json(
            StatusCode::NOT_FOUND,
            "アップロード済みファイルが見つかりません。再度アップロードしてください",
        ),
        PipelineError::Internal(err) => {
            error!(error = %err, "internal error during ingestion");
            error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ファイル処理中に予期せぬエラーが発生しました",
            )
        }
    }
}

fn outcome_response(outcome: IngestOutcome) -> Response {
    match outcome {
        IngestOutcome::Ingested {
            inserted,
            dropped_unmapped,
            mirror,
        } => {
            let message = match &mirror {
                kura_core::MirrorStatus::Failed { .. } => {
                    "データは保存されましたが、台帳への転記に失敗しました"
                }
                _ => "ファイルが正常に処理されました",
            };
            Json(json!({
                "status": "success",
                "message": message,
                "inserted": inserted,
                "dropped_unmapped": dropped_unmapped,
                "mirror": mirror,
            }))
            .into_response()
        }
        IngestOutcome::NoMatchingRows => Json(json!({
            "status": "success",
            "message": "対象カテゴリの行はありませんでした",
            "inserted": 0,
        }))
        .into_response(),
        IngestOutcome::ConfirmationRequired {
            filename,
            content_hash,
        } => Json(json!({
            "status": "confirm",
            "message": "同じ内容のファイルが既にアップロードされています。上書きして処理を続行しますか？",
            "filename": filename,
            "file_hash": content_hash,
        }))
        .into_response(),
    }
}

async fn upload_handler(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut upload: Option<(String, Vec<u8>)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let filename = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => upload = Some((filename, bytes.to_vec())),
                    Err(_) => {
                        return error_json(StatusCode::BAD_REQUEST, "ファイルを受信できませんでした")
                    }
                }
            }
            Ok(None) => break,
            Err(_) => return error_json(StatusCode::BAD_REQUEST, "不正なリクエストです"),
        }
    }

    let Some((filename, bytes)) = upload else {
        return error_json(StatusCode::BAD_REQUEST, "ファイルがありません");
    };
    if filename.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "ファイルが選択されていません");
    }
    if !is_allowed_csv(&filename) {
        return error_json(StatusCode::BAD_REQUEST, "許可されていないファイル形式です");
    }

    match state.pipeline.ingest(&filename, &bytes).await {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => pipeline_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ConfirmForm {
    filename: String,
    file_hash: String,
}

async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ConfirmForm>,
) -> Response {
    match state.pipeline.confirm(&form.filename, &form.file_hash).await {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => pipeline_error_response(err),
    }
}

async fn data_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.list_sales().await {
        Ok(sales) => Json(sales).into_response(),
        Err(err) => pipeline_error_response(err),
    }
}

async fn delete_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.delete_all_sales().await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(err) => pipeline_error_response(err),
    }
}

async fn delete_one_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.pipeline.delete_sale(id).await {
        Ok(0) => error_json(StatusCode::NOT_FOUND, "該当するデータがありません"),
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(err) => pipeline_error_response(err),
    }
}

async fn export_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.export_xlsx().await {
        Ok(bytes) => (
            [
                (
                    header::CONTENT_TYPE,
                    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                ),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"sales.xlsx\"",
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => pipeline_error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use kura_ingest::ProductMap;
    use kura_ledger::{LedgerClient, LedgerMirror, MemoryLedgerClient, SummaryDefaults};
    use kura_storage::{SalesStore, UploadVault};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const CSV: &str = "商品名,カテゴリ,単価,税率,割引,店舗,担当,販売本数\n\
                       瓶ビール(大),お酒類,650,10,0,本店,佐藤,100\n";

    async fn test_app() -> (Router, TempDir) {
        let store = SalesStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let vault_dir = TempDir::new().unwrap();
        let vault = UploadVault::new(vault_dir.path());
        let map = ProductMap::from_entries([("瓶ビール(大)", "瓶ビール大")]);
        let mirror = LedgerMirror::new(
            Arc::new(MemoryLedgerClient::default()) as Arc<dyn LedgerClient>,
            SummaryDefaults::default(),
        );
        let pipeline = IngestPipeline::new(store, vault, map).with_mirror(mirror);
        (app(AppState::new(Arc::new(pipeline))), vault_dir)
    }

    fn multipart_upload(filename: &str, content: &str) -> axum::http::Request<Body> {
        let boundary = "kura-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: text/csv\r\n\r\n\
             {content}\r\n\
             --{boundary}--\r\n"
        );
        axum::http::Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upload_then_list() {
        let (app, _vault) = test_app().await;

        let resp = app
            .clone()
            .oneshot(multipart_upload("20250115-store.csv", CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["inserted"], 1);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/data")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["product_name"], "瓶ビール大");
    }

    #[tokio::test]
    async fn duplicate_upload_then_confirm() {
        let (app, _vault) = test_app().await;

        app.clone()
            .oneshot(multipart_upload("20250115-store.csv", CSV))
            .await
            .unwrap();
        let resp = app
            .clone()
            .oneshot(multipart_upload("20250115-store.csv", CSV))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["status"], "confirm");
        let file_hash = body["file_hash"].as_str().unwrap().to_string();

        let form = format!("filename=20250115-store.csv&file_hash={file_hash}");
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/confirm_upload")
                    .header(
                        header::CONTENT_TYPE,
                        "application/x-www-form-urlencoded",
                    )
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "success");
    }

    #[tokio::test]
    async fn rejects_non_csv_uploads() {
        let (app, _vault) = test_app().await;
        let resp = app
            .oneshot(multipart_upload("20250115-store.txt", CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["message"], "許可されていないファイル形式です");
    }

    #[tokio::test]
    async fn validation_errors_map_to_bad_request() {
        let (app, _vault) = test_app().await;
        let resp = app
            .oneshot(multipart_upload("nodate.csv", CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn export_is_an_xlsx_attachment() {
        let (app, _vault) = test_app().await;
        app.clone()
            .oneshot(multipart_upload("20250115-store.csv", CSV))
            .await
            .unwrap();

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("sales.xlsx"));
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[tokio::test]
    async fn purge_endpoints() {
        let (app, _vault) = test_app().await;
        app.clone()
            .oneshot(multipart_upload("20250115-store.csv", CSV))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/data/99999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/data")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["deleted"], 1);
    }
}
