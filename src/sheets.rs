use crate::config::SheetSettings;
use crate::google_auth::{AuthError, TokenProvider};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{future::Future, sync::Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("sheet request failed: {0}")]
    Request(String),
    #[error("sheet API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("column `{0}` not found in header row")]
    MissingColumn(String),
    #[error("invalid sheet response: {0}")]
    Deserialize(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// A spreadsheet row still waiting for its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    /// 1-based sheet row number; data starts at 2.
    pub row: usize,
    pub link: String,
}

pub trait ProductSheet: Send + Sync {
    /// Rows with a link and an empty image cell.
    fn pending_rows(&self) -> impl Future<Output = Result<Vec<SheetRow>, SheetError>> + Send;

    fn update_row(
        &self,
        row: usize,
        values: &[(String, String)],
    ) -> impl Future<Output = Result<(), SheetError>> + Send;

    fn has_column(&self, name: &str) -> bool;
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Google Sheets REST v4 values API, authenticated with a bearer token.
#[derive(Debug)]
pub struct GoogleSheetsClient {
    http: Client,
    settings: SheetSettings,
    auth: TokenProvider,
    header: Mutex<Vec<String>>,
}

impl GoogleSheetsClient {
    pub fn new(http: Client, settings: SheetSettings, auth: TokenProvider) -> Self {
        Self {
            http,
            settings,
            auth,
            header: Mutex::new(Vec::new()),
        }
    }

    /// Sends with a bearer token; a 401 refreshes the token and retries once.
    async fn send_authorized(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, SheetError> {
        let token = self.auth.access_token().await?;
        let response = build()
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SheetError::Request(err.to_string()))?;
        if response.status() != StatusCode::UNAUTHORIZED || !self.auth.can_refresh() {
            return ensure_success(response).await;
        }

        warn!(target = "sorteio.sheets", "access token rejected; refreshing");
        self.auth.invalidate().await;
        let token = self.auth.access_token().await?;
        let response = build()
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SheetError::Request(err.to_string()))?;
        ensure_success(response).await
    }

    fn sheet_ref(&self) -> String {
        format!("'{}'", self.settings.sheet_name.replace('\'', "''"))
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        let header = self.header.lock().unwrap_or_else(|p| p.into_inner());
        find_column(&header, name)
    }

    async fn fetch_values(&self) -> Result<Vec<Vec<String>>, SheetError> {
        let range = format!("{}!A1:ZZ", self.sheet_ref());
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.settings.api_base,
            self.settings.spreadsheet_id,
            urlencoding::encode(&range)
        );
        let response = self.send_authorized(|| self.http.get(&url)).await?;
        let payload: ValueRange = response
            .json()
            .await
            .map_err(|err| SheetError::Deserialize(err.to_string()))?;
        Ok(payload
            .values
            .into_iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }
}

impl ProductSheet for GoogleSheetsClient {
    async fn pending_rows(&self) -> Result<Vec<SheetRow>, SheetError> {
        let values = self.fetch_values().await?;
        let header: Vec<String> = values.first().cloned().unwrap_or_default();
        let link_idx = find_column(&header, &self.settings.link_column)
            .ok_or_else(|| SheetError::MissingColumn(self.settings.link_column.clone()))?;
        let image_idx = find_column(&header, &self.settings.image_column)
            .ok_or_else(|| SheetError::MissingColumn(self.settings.image_column.clone()))?;
        *self.header.lock().unwrap_or_else(|p| p.into_inner()) = header;

        let rows: Vec<SheetRow> = values
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(idx, cells)| {
                let link = cells.get(link_idx).map(|c| c.trim()).unwrap_or_default();
                let image = cells.get(image_idx).map(|c| c.trim()).unwrap_or_default();
                (!link.is_empty() && image.is_empty()).then(|| SheetRow {
                    row: idx + 1,
                    link: link.to_string(),
                })
            })
            .collect();
        debug!(target = "sorteio.sheets", total = values.len().saturating_sub(1), pending = rows.len(), "sheet read");
        Ok(rows)
    }

    async fn update_row(&self, row: usize, values: &[(String, String)]) -> Result<(), SheetError> {
        let mut data = Vec::with_capacity(values.len());
        for (column, value) in values {
            let idx = self
                .column_index(column)
                .ok_or_else(|| SheetError::MissingColumn(column.clone()))?;
            data.push(json!({
                "range": format!("{}!{}{}", self.sheet_ref(), column_letter(idx), row),
                "values": [[value]],
            }));
        }
        let url = format!(
            "{}/v4/spreadsheets/{}/values:batchUpdate",
            self.settings.api_base, self.settings.spreadsheet_id
        );
        let body = json!({ "valueInputOption": "RAW", "data": data });
        self.send_authorized(|| self.http.post(&url).json(&body)).await?;
        info!(target = "sorteio.sheets", row, cells = values.len(), "row updated");
        Ok(())
    }

    fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }
}

async fn ensure_success(response: Response) -> Result<Response, SheetError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SheetError::Status {
        status: status.as_u16(),
        body,
    })
}

fn find_column(header: &[String], name: &str) -> Option<usize> {
    header
        .iter()
        .position(|cell| cell.trim().eq_ignore_ascii_case(name.trim()))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Zero-based column index to A1 letters.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SheetAuth;
    use crate::google_auth::{SHEETS_SCOPE, tests::test_key};
    use wiremock::matchers::{body_partial_json, header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> SheetSettings {
        SheetSettings {
            api_base: server.uri(),
            spreadsheet_id: "sheet-id".into(),
            sheet_name: "Sorteios".into(),
            auth: SheetAuth::Token("tok".into()),
            link_column: "Link".into(),
            image_column: "Imagem".into(),
            vertical_column: "Imagem Vertical".into(),
        }
    }

    fn client(server: &MockServer) -> GoogleSheetsClient {
        GoogleSheetsClient::new(Client::new(), settings(server), TokenProvider::fixed("tok"))
    }

    fn service_account_client(server: &MockServer) -> GoogleSheetsClient {
        let auth = TokenProvider::service_account(
            Client::new(),
            test_key(format!("{}/token", server.uri())),
            SHEETS_SCOPE,
        )
        .expect("provider");
        GoogleSheetsClient::new(Client::new(), settings(server), auth)
    }

    async fn mount_values(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/v4/spreadsheets/sheet-id/values/.+"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "range": "Sorteios!A1:ZZ",
                "values": [
                    ["Produto", "Link", "Imagem", "Imagem Vertical"],
                    ["Fone", "https://www.natura.com.br/p/item/NATBRA-1", "", ""],
                    ["Caixa", "https://www.natura.com.br/p/item/NATBRA-2", "https://files.catbox.moe/x.png"],
                    ["Vazio"],
                    ["Mouse", " https://www.natura.com.br/p/item/NATBRA-3 "]
                ]
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn column_letters_roll_over() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
        assert_eq!(column_letter(701), "ZZ");
    }

    #[tokio::test]
    async fn pending_rows_need_link_and_empty_image() {
        let server = MockServer::start().await;
        mount_values(&server).await;
        let sheet = client(&server);

        let rows = sheet.pending_rows().await.expect("rows");
        assert_eq!(
            rows,
            vec![
                SheetRow {
                    row: 2,
                    link: "https://www.natura.com.br/p/item/NATBRA-1".into()
                },
                SheetRow {
                    row: 5,
                    link: "https://www.natura.com.br/p/item/NATBRA-3".into()
                },
            ]
        );
        assert!(sheet.has_column("imagem vertical"));
        assert!(!sheet.has_column("Story"));
    }

    #[tokio::test]
    async fn missing_link_column_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [["Produto", "Imagem"]]
            })))
            .mount(&server)
            .await;
        let err = client(&server).pending_rows().await.unwrap_err();
        assert!(matches!(err, SheetError::MissingColumn(col) if col == "Link"));
    }

    #[tokio::test]
    async fn update_writes_a1_ranges_for_named_columns() {
        let server = MockServer::start().await;
        mount_values(&server).await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet-id/values:batchUpdate"))
            .and(body_partial_json(json!({
                "valueInputOption": "RAW",
                "data": [
                    { "range": "'Sorteios'!C2", "values": [["https://files.catbox.moe/a.png"]] },
                    { "range": "'Sorteios'!D2", "values": [["https://files.catbox.moe/b.png"]] }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let sheet = client(&server);
        sheet.pending_rows().await.expect("rows");
        sheet
            .update_row(
                2,
                &[
                    ("Imagem".into(), "https://files.catbox.moe/a.png".into()),
                    ("Imagem Vertical".into(), "https://files.catbox.moe/b.png".into()),
                ],
            )
            .await
            .expect("update");
    }

    #[tokio::test]
    async fn service_account_token_is_reused_across_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_values(&server).await;

        let sheet = service_account_client(&server);
        sheet.pending_rows().await.expect("rows");
        sheet.pending_rows().await.expect("rows");
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_and_retried_once() {
        let server = MockServer::start().await;
        // First mint hands out a token the API has already revoked.
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "revoked",
                "expires_in": 3600
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer revoked"))
            .respond_with(ResponseTemplate::new(401).set_body_string("UNAUTHENTICATED"))
            .expect(1)
            .mount(&server)
            .await;
        mount_values(&server).await;

        let rows = service_account_client(&server)
            .pending_rows()
            .await
            .expect("rows after refresh");
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn fixed_token_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("UNAUTHENTICATED"))
            .expect(1)
            .mount(&server)
            .await;
        let err = client(&server).pending_rows().await.unwrap_err();
        assert!(matches!(err, SheetError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("PERMISSION_DENIED"))
            .mount(&server)
            .await;
        let err = client(&server).pending_rows().await.unwrap_err();
        assert!(matches!(err, SheetError::Status { status: 403, ref body } if body == "PERMISSION_DENIED"));
    }
}
