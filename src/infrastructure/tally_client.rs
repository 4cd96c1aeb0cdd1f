use async_trait::async_trait;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

use crate::domain::entities::raw_record::{format_tally_date, parse_tally_date, FieldValue, RawRecord};
use crate::domain::entities::report_key::{ReportKey, ReportKind};
use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::repositories::source_client::SourceClient;

/// Default Tally Prime XML server
pub const DEFAULT_TALLY_URL: &str = "http://localhost:9000";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";
const EXPORT_FORMAT: &str = "$$SysName:XML";

/// Elements that become one record each. Bill allocations nest inside
/// ledgers and are flattened into records of their own.
const RECORD_ENTITIES: [&str; 6] = [
    "VOUCHER",
    "STOCKITEM",
    "LEDGER",
    "BILLALLOCATIONS",
    "GROUP",
    "COMPANY",
];

#[derive(Debug, Clone)]
pub struct TallyConfig {
    pub url: Url,
    pub timeout: Duration,
}

impl TallyConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Export request sent for one report kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportRequest {
    /// `Collection` or `Report`
    pub request_type: &'static str,
    pub id: &'static str,
}

pub fn export_request(kind: ReportKind) -> ExportRequest {
    let (request_type, id) = match kind {
        ReportKind::Sales => ("Collection", "Sales Vouchers"),
        ReportKind::Purchases => ("Collection", "Purchase Vouchers"),
        ReportKind::Inventory => ("Collection", "Stock Items"),
        ReportKind::Outstanding => ("Collection", "Outstanding"),
        ReportKind::ProfitLoss => ("Report", "Profit Loss"),
        ReportKind::BalanceSheet => ("Report", "Balance Sheet"),
        ReportKind::CashFlow => ("Report", "Day Book"),
    };
    ExportRequest { request_type, id }
}

type XmlWriter = Writer<Vec<u8>>;

fn write_element(writer: &mut XmlWriter, name: &str, text: &str) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesStart::new(name).to_end()))?;
    Ok(())
}

fn open(writer: &mut XmlWriter, name: &str) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(BytesStart::new(name)))
}

fn close(writer: &mut XmlWriter, name: &str) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::End(BytesStart::new(name).to_end()))
}

fn envelope_error(e: quick_xml::Error) -> PipelineError {
    PipelineError::InvalidRequest(format!("Failed to build request envelope: {}", e))
}

fn finish(writer: XmlWriter) -> PipelineResult<String> {
    String::from_utf8(writer.into_inner())
        .map_err(|e| PipelineError::InvalidRequest(format!("Envelope is not UTF-8: {}", e)))
}

fn write_export(
    w: &mut XmlWriter,
    request: ExportRequest,
    key: &ReportKey,
) -> Result<(), quick_xml::Error> {
    open(w, "ENVELOPE")?;
    open(w, "HEADER")?;
    write_element(w, "VERSION", "1")?;
    write_element(w, "TALLYREQUEST", "Export")?;
    write_element(w, "TYPE", request.request_type)?;
    write_element(w, "ID", request.id)?;
    close(w, "HEADER")?;

    open(w, "BODY")?;
    open(w, "DESC")?;
    open(w, "STATICVARIABLES")?;
    if let Some(range) = &key.date_range {
        write_element(w, "SVFROMDATE", &format_tally_date(range.from))?;
        write_element(w, "SVTODATE", &format_tally_date(range.to))?;
    }
    write_element(w, "SVEXPORTFORMAT", EXPORT_FORMAT)?;
    if let Some(company) = key.company() {
        write_element(w, "SVCURRENTCOMPANY", company)?;
    }
    close(w, "STATICVARIABLES")?;
    close(w, "DESC")?;
    close(w, "BODY")?;
    close(w, "ENVELOPE")
}

fn write_ping(w: &mut XmlWriter) -> Result<(), quick_xml::Error> {
    open(w, "ENVELOPE")?;
    open(w, "HEADER")?;
    write_element(w, "VERSION", "1")?;
    write_element(w, "TALLYREQUEST", "PING")?;
    close(w, "HEADER")?;
    close(w, "ENVELOPE")
}

/// Export envelope for `request`, carrying the key's date range and company
pub fn build_export_envelope(request: ExportRequest, key: &ReportKey) -> PipelineResult<String> {
    let mut w = Writer::new(Vec::new());
    write_export(&mut w, request, key).map_err(envelope_error)?;
    finish(w)
}

pub fn build_ping_envelope() -> PipelineResult<String> {
    let mut w = Writer::new(Vec::new());
    write_ping(&mut w).map_err(envelope_error)?;
    finish(w)
}

fn malformed(msg: impl std::fmt::Display) -> PipelineError {
    PipelineError::UpstreamMalformed(msg.to_string())
}

fn field_value(name: &str, text: String) -> FieldValue {
    if name.ends_with("DATE") {
        if let Some(date) = parse_tally_date(&text) {
            return FieldValue::Date(date);
        }
    }
    FieldValue::Text(text)
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_uppercase()
}

fn record_entity(name: &str) -> Option<&'static str> {
    let bare = name.strip_suffix(".LIST").unwrap_or(name);
    RECORD_ENTITIES.iter().copied().find(|e| *e == bare)
}

fn name_attribute(e: &BytesStart) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref().eq_ignore_ascii_case(b"NAME"))
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

struct OpenRecord {
    index: usize,
    depth: usize,
}

/// Parse an export response into records, in document order.
///
/// Direct children of a record element become its fields. Bill allocations
/// get the owning ledger's name under `LEDGERNAME`.
pub fn parse_envelope(body: &str) -> PipelineResult<Vec<RawRecord>> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut records: Vec<RawRecord> = Vec::new();
    let mut open_records: Vec<OpenRecord> = Vec::new();
    let mut field: Option<(String, usize)> = None;
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut in_line_error = false;
    let mut line_error: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                depth += 1;
                let name = element_name(&e);
                if depth == 1 {
                    if name != "ENVELOPE" {
                        return Err(malformed(format!("Unexpected root element <{}>", name)));
                    }
                    saw_root = true;
                }
                if name == "LINEERROR" {
                    in_line_error = true;
                    line_error.get_or_insert_with(String::new);
                }

                if let Some(entity) = record_entity(&name) {
                    let mut record = RawRecord::new(entity);
                    if let Some(n) = name_attribute(&e) {
                        record.insert("NAME", FieldValue::Text(n));
                    }
                    if entity == "BILLALLOCATIONS" {
                        if let Some(parent) = open_records.last() {
                            let ledger = records[parent.index].text("NAME");
                            record.insert("LEDGERNAME", FieldValue::Text(ledger));
                        }
                    }
                    open_records.push(OpenRecord {
                        index: records.len(),
                        depth,
                    });
                    records.push(record);
                } else if let Some(open) = open_records.last() {
                    if depth == open.depth + 1 {
                        field = Some((name, depth));
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(entity) = record_entity(&element_name(&e)) {
                    let mut record = RawRecord::new(entity);
                    if let Some(n) = name_attribute(&e) {
                        record.insert("NAME", FieldValue::Text(n));
                    }
                    records.push(record);
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(malformed)?.into_owned();
                if in_line_error {
                    if let Some(msg) = line_error.as_mut() {
                        msg.push_str(&text);
                    }
                }
                if let (Some((name, field_depth)), Some(open)) = (&field, open_records.last()) {
                    if *field_depth == depth {
                        records[open.index].insert(name, field_value(name, text));
                    }
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return Err(malformed("Unbalanced closing tag"));
                }
                if matches!(&field, Some((_, d)) if *d == depth) {
                    field = None;
                }
                in_line_error = false;
                if matches!(open_records.last(), Some(open) if open.depth == depth) {
                    if let Some(open) = open_records.pop() {
                        backfill_ledger_name(&mut records, open.index);
                    }
                }
                depth -= 1;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(malformed(format!(
                    "Invalid XML at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(malformed("Response has no ENVELOPE root"));
    }
    if depth != 0 {
        return Err(malformed("Response ended inside an open element"));
    }
    if let Some(msg) = line_error {
        return Err(malformed(format!("Tally reported an error: {}", msg.trim())));
    }
    Ok(records)
}

/// Bill allocations read before their ledger's NAME get it once the ledger
/// closes. Every record after `index` was opened inside it.
fn backfill_ledger_name(records: &mut [RawRecord], index: usize) {
    if !records[index].is("LEDGER") {
        return;
    }
    let ledger = records[index].text("NAME");
    for record in records[index + 1..].iter_mut() {
        if record.is("BILLALLOCATIONS") && record.text("LEDGERNAME").is_empty() {
            record.insert("LEDGERNAME", FieldValue::Text(ledger.clone()));
        }
    }
}

/// Source client for the Tally Prime XML server
pub struct TallyClient {
    client: Client,
    config: TallyConfig,
}

impl TallyClient {
    pub fn new(config: TallyConfig) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                PipelineError::UpstreamUnavailable(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client, config })
    }

    /// Transport failures, including a stall while the body streams in, mean
    /// the server is unavailable. Only the payload itself can be malformed.
    fn transport_error(&self, e: reqwest::Error, stage: &str) -> PipelineError {
        if e.is_timeout() {
            PipelineError::UpstreamUnavailable(format!(
                "Tally server did not answer within {}s",
                self.config.timeout.as_secs()
            ))
        } else {
            PipelineError::UpstreamUnavailable(format!("{} failed: {}", stage, e))
        }
    }

    async fn post(&self, envelope: String) -> PipelineResult<String> {
        let response = self
            .client
            .post(self.config.url.as_str())
            .header(CONTENT_TYPE, XML_CONTENT_TYPE)
            .body(envelope)
            .send()
            .await
            .map_err(|e| self.transport_error(e, "Request to Tally server"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "Tally server returned {}",
                status
            )));
        }

        response
            .text()
            .await
            .map_err(|e| self.transport_error(e, "Reading Tally response"))
    }
}

#[async_trait]
impl SourceClient for TallyClient {
    fn name(&self) -> &str {
        "tally"
    }

    async fn fetch(&self, kind: ReportKind, key: &ReportKey) -> PipelineResult<Vec<RawRecord>> {
        let started = Instant::now();
        let envelope = build_export_envelope(export_request(kind), key)?;
        let body = self.post(envelope).await?;
        let records = parse_envelope(&body)?;
        debug!(
            kind = %kind,
            key = %key,
            records = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched records from Tally"
        );
        Ok(records)
    }

    async fn test_connection(&self) -> PipelineResult<()> {
        self.post(build_ping_envelope()?).await?;
        info!(url = %self.config.url, "Tally server reachable");
        Ok(())
    }

    async fn company_list(&self) -> PipelineResult<Vec<String>> {
        let request = ExportRequest {
            request_type: "Collection",
            id: "Companies",
        };
        let envelope = build_export_envelope(request, &ReportKey::unfiltered(ReportKind::Sales, None))?;
        let body = self.post(envelope).await?;

        let mut names: Vec<String> = Vec::new();
        for record in parse_envelope(&body)?.iter().filter(|r| r.is("COMPANY")) {
            let name = record.text("NAME");
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        debug!(companies = names.len(), "Fetched company list from Tally");
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::report_key::DateRange;
    use axum::{routing::post, Router};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    const SALES_RESPONSE: &str = r#"
        <ENVELOPE>
          <HEADER><VERSION>1</VERSION><STATUS>1</STATUS></HEADER>
          <BODY><DATA><COLLECTION>
            <VOUCHER VCHTYPE="Sales">
              <DATE>20240603</DATE>
              <VOUCHERNUMBER>S-1</VOUCHERNUMBER>
              <PARTYLEDGERNAME>Acme &amp; Sons</PARTYLEDGERNAME>
              <AMOUNT>1,250.50</AMOUNT>
              <ALLLEDGERENTRIES.LIST><LEDGERNAME>Sales</LEDGERNAME></ALLLEDGERENTRIES.LIST>
            </VOUCHER>
            <VOUCHER>
              <DATE>20240604</DATE>
              <VOUCHERNUMBER>S-2</VOUCHERNUMBER>
              <AMOUNT>99</AMOUNT>
            </VOUCHER>
          </COLLECTION></DATA></BODY>
        </ENVELOPE>"#;

    fn key_with_company() -> ReportKey {
        let mut filters = BTreeMap::new();
        filters.insert("company".to_string(), "Acme & Sons".to_string());
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        )
        .unwrap();
        ReportKey::new(ReportKind::Sales, Some(range), filters)
    }

    #[test]
    fn test_export_envelope_carries_variables() {
        let envelope =
            build_export_envelope(export_request(ReportKind::Sales), &key_with_company()).unwrap();
        assert!(envelope.starts_with("<ENVELOPE><HEADER><VERSION>1</VERSION>"));
        assert!(envelope.contains("<TALLYREQUEST>Export</TALLYREQUEST>"));
        assert!(envelope.contains("<TYPE>Collection</TYPE><ID>Sales Vouchers</ID>"));
        assert!(envelope.contains("<SVFROMDATE>01-Apr-2024</SVFROMDATE>"));
        assert!(envelope.contains("<SVTODATE>30-Jun-2024</SVTODATE>"));
        assert!(envelope.contains("<SVEXPORTFORMAT>$$SysName:XML</SVEXPORTFORMAT>"));
        assert!(envelope.contains("<SVCURRENTCOMPANY>Acme &amp; Sons</SVCURRENTCOMPANY>"));
    }

    #[test]
    fn test_undated_envelope_omits_dates() {
        let key = ReportKey::unfiltered(ReportKind::Inventory, None);
        let envelope = build_export_envelope(export_request(ReportKind::Inventory), &key).unwrap();
        assert!(envelope.contains("<ID>Stock Items</ID>"));
        assert!(!envelope.contains("SVFROMDATE"));
        assert!(!envelope.contains("SVCURRENTCOMPANY"));
    }

    #[test]
    fn test_ping_envelope() {
        assert_eq!(
            build_ping_envelope().unwrap(),
            "<ENVELOPE><HEADER><VERSION>1</VERSION><TALLYREQUEST>PING</TALLYREQUEST></HEADER></ENVELOPE>"
        );
    }

    #[test]
    fn test_parse_vouchers() {
        let records = parse_envelope(SALES_RESPONSE).unwrap();
        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert!(first.is("VOUCHER"));
        assert_eq!(first.text("PARTYLEDGERNAME"), "Acme & Sons");
        assert_eq!(
            first.fields.get("DATE"),
            Some(&FieldValue::Date(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()))
        );
        // nested ledger entries are not voucher fields
        assert!(!first.fields.contains_key("LEDGERNAME"));
        assert_eq!(records[1].text("VOUCHERNUMBER"), "S-2");
    }

    #[test]
    fn test_bill_allocations_are_flattened() {
        let body = r#"<ENVELOPE><BODY><DATA>
            <LEDGER NAME="Acme Traders">
              <CLOSINGBALANCE>15000</CLOSINGBALANCE>
              <BILLALLOCATIONS.LIST>
                <NAME>INV-7</NAME><BILLDATE>20240101</BILLDATE><AMOUNT>15000</AMOUNT>
              </BILLALLOCATIONS.LIST>
            </LEDGER>
            <LEDGER>
              <BILLALLOCATIONS.LIST><NAME>INV-9</NAME></BILLALLOCATIONS.LIST>
              <NAME>Late Name</NAME>
            </LEDGER>
        </DATA></BODY></ENVELOPE>"#;
        let records = parse_envelope(body).unwrap();
        let entities: Vec<&str> = records.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(entities, vec!["LEDGER", "BILLALLOCATIONS", "LEDGER", "BILLALLOCATIONS"]);
        assert_eq!(records[0].text("NAME"), "Acme Traders");
        assert_eq!(records[1].text("LEDGERNAME"), "Acme Traders");
        assert_eq!(records[1].text("NAME"), "INV-7");
        assert_eq!(records[1].date("BILLDATE"), NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(records[3].text("LEDGERNAME"), "Late Name");
    }

    #[test]
    fn test_line_error_is_malformed() {
        let body = "<ENVELOPE><BODY><DATA><LINEERROR>Could not find Report 'Foo'</LINEERROR></DATA></BODY></ENVELOPE>";
        match parse_envelope(body) {
            Err(PipelineError::UpstreamMalformed(msg)) => assert!(msg.contains("Could not find Report")),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_payloads_are_malformed() {
        for body in [
            "",
            "not xml at all",
            "<RESPONSE>Unknown Request</RESPONSE>",
            "<ENVELOPE><BODY>",
            "<ENVELOPE></BODY></ENVELOPE>",
        ] {
            assert!(
                matches!(parse_envelope(body), Err(PipelineError::UpstreamMalformed(_))),
                "accepted {:?}",
                body
            );
        }
    }

    #[test]
    fn test_empty_collection_yields_no_records() {
        let body = "<ENVELOPE><BODY><DATA><COLLECTION/></DATA></BODY></ENVELOPE>";
        assert_eq!(parse_envelope(body).unwrap(), Vec::new());
    }

    async fn serve(response: &'static str) -> Url {
        let app = Router::new().route("/", post(move || async move { response }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_over_http() {
        let url = serve(SALES_RESPONSE).await;
        let client = TallyClient::new(TallyConfig::new(url)).unwrap();
        let records = client
            .fetch(ReportKind::Sales, &key_with_company())
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(client.test_connection().await.is_ok());
    }

    #[tokio::test]
    async fn test_company_list() {
        let url = serve(
            "<ENVELOPE><BODY><DATA><COLLECTION>\
             <COMPANY NAME=\"Acme Traders\"/><COMPANY><NAME>Beta Stores</NAME></COMPANY>\
             <COMPANY NAME=\"Acme Traders\"/>\
             </COLLECTION></DATA></BODY></ENVELOPE>",
        )
        .await;
        let client = TallyClient::new(TallyConfig::new(url)).unwrap();
        assert_eq!(
            client.company_list().await.unwrap(),
            vec!["Acme Traders".to_string(), "Beta Stores".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stalled_body_is_unavailable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n<ENVELOPE>")
                .await
                .unwrap();
            // headers sent, body never finishes
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let config = TallyConfig {
            url: Url::parse(&format!("http://{}/", addr)).unwrap(),
            timeout: Duration::from_secs(1),
        };
        let client = TallyClient::new(config).unwrap();
        let result = client.fetch(ReportKind::Sales, &key_with_company()).await;
        match result {
            Err(e @ PipelineError::UpstreamUnavailable(_)) => assert!(e.is_transient()),
            other => panic!("expected unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = TallyConfig {
            url: Url::parse(&format!("http://{}/", addr)).unwrap(),
            timeout: Duration::from_secs(2),
        };
        let client = TallyClient::new(config).unwrap();
        assert!(matches!(
            client.fetch(ReportKind::Sales, &key_with_company()).await,
            Err(PipelineError::UpstreamUnavailable(_))
        ));
        assert!(matches!(
            client.test_connection().await,
            Err(PipelineError::UpstreamUnavailable(_))
        ));
    }
}
