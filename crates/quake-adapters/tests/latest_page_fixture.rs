use chrono::{TimeZone, Utc};
use quake_adapters::{EventSource, FetchedPage, LatestEventsPage, PHIVOLCS_SOURCE_ID};
use quake_core::partition_key_for;

fn fixture_page(body: &str) -> FetchedPage {
    FetchedPage {
        url: "https://earthquake.phivolcs.dost.gov.ph/".to_string(),
        content_type: "text/html".to_string(),
        body: body.as_bytes().to_vec(),
        fetched_at: Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).single().unwrap(),
    }
}

#[test]
fn rows_spanning_a_month_boundary_route_to_two_partitions() {
    let html = "<table>\
        <tr><th>Date-Time</th><th>Latitude</th><th>Longitude</th><th>Depth</th><th>Magnitude</th><th>Location</th></tr>\
        <tr><td>01 September 2025 - 12:03 AM</td><td>12.01</td><td>125.50</td><td>001</td><td>1.9</td><td>Sulat (Eastern Samar)</td></tr>\
        <tr><td>31 August 2025 - 11:58 PM</td><td>5.91</td><td>126.22</td><td>105</td><td>3.0</td><td>Sarangani (Davao Occidental)</td></tr>\
        </table>";
    let source = LatestEventsPage::new(PHIVOLCS_SOURCE_ID, "https://earthquake.phivolcs.dost.gov.ph/");
    let parsed = source.parse_page(&fixture_page(html)).expect("parse");

    let keys = parsed
        .rows
        .iter()
        .map(|row| partition_key_for(&row.timestamp).expect("timestamp").to_string())
        .collect::<Vec<_>>();
    assert_eq!(keys, vec!["2025_09", "2025_08"]);
}

#[test]
fn invalid_utf8_is_replaced_not_fatal() {
    let mut body = b"<table><tr><th>Magnitude</th></tr><tr>".to_vec();
    body.extend_from_slice(&[0xff, 0xfe]);
    body.extend_from_slice(b"<td>x</td></tr></table>");
    let source = LatestEventsPage::new(PHIVOLCS_SOURCE_ID, "https://earthquake.phivolcs.dost.gov.ph/");
    let page = FetchedPage {
        body,
        ..fixture_page("")
    };
    let parsed = source.parse_page(&page).expect("lossy decode");
    assert!(parsed.table_found);
    assert!(parsed.rows.is_empty());
    assert_eq!(parsed.short_rows, 1);
}
