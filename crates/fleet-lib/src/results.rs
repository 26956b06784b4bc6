//! Locust result ingestion
//!
//! Reads the `_stats.csv` artifact of a headless run and maps its
//! `Aggregated` row onto [`ResultMetrics`].

use crate::models::ResultMetrics;
use csv::StringRecord;
use thiserror::Error;
use tracing::warn;

const AGGREGATE_ROW: &str = "Aggregated";

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("malformed stats file: {0}")]
    Csv(#[from] csv::Error),

    #[error("stats file has no Aggregated row")]
    MissingAggregate,
}

/// Parse a stats CSV. Non-numeric cells such as `N/A` read as zero.
pub fn parse_stats(bytes: &[u8]) -> Result<ResultMetrics, ResultsError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    let name_idx = headers.iter().position(|h| h == "Name");

    for record in reader.records() {
        let record = record?;
        let is_aggregate = match name_idx {
            Some(idx) => record.get(idx) == Some(AGGREGATE_ROW),
            None => record.iter().any(|cell| cell == AGGREGATE_ROW),
        };
        if is_aggregate {
            return Ok(metrics_from_row(&headers, &record));
        }
    }

    Err(ResultsError::MissingAggregate)
}

/// Turn an optional artifact into metrics; never fails
pub fn ingest(artifact: Option<&[u8]>) -> ResultMetrics {
    let Some(bytes) = artifact else {
        warn!("No stats artifact, recording zero metrics");
        return ResultMetrics::default();
    };

    match parse_stats(bytes) {
        Ok(metrics) => metrics,
        Err(e) => {
            warn!(error = %e, "Unreadable stats artifact, recording zero metrics");
            ResultMetrics::default()
        }
    }
}

fn metrics_from_row(headers: &StringRecord, row: &StringRecord) -> ResultMetrics {
    let number = |column: &str| -> f64 {
        headers
            .iter()
            .position(|h| h == column)
            .and_then(|idx| row.get(idx))
            .and_then(|cell| cell.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    };
    let count = |column: &str| -> u64 { number(column).max(0.0).round() as u64 };

    let total_requests = count("Request Count");
    let total_failures = count("Failure Count");
    let error_rate = if total_requests > 0 {
        total_failures as f64 / total_requests as f64 * 100.0
    } else {
        0.0
    };

    ResultMetrics {
        total_requests,
        total_failures,
        avg_response_time: number("Average Response Time"),
        max_response_time: number("Max Response Time"),
        min_response_time: number("Min Response Time"),
        median_response_time: number("Median Response Time"),
        p95_response_time: number("95%"),
        p99_response_time: number("99%"),
        requests_per_second: number("Requests/s"),
        failures_per_second: number("Failures/s"),
        error_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: &str = "\
Type,Name,Request Count,Failure Count,Median Response Time,Average Response Time,Min Response Time,Max Response Time,Average Content Size,Requests/s,Failures/s,50%,66%,75%,80%,90%,95%,98%,99%,99.9%,99.99%,100%
GET,/api/users,600,12,45,52.3,8.1,410.7,512,10.0,0.2,45,50,55,60,80,120,200,250,400,410,410
POST,/api/orders,400,8,60,70.1,10.4,520.2,256,6.7,0.13,60,65,70,75,90,140,220,300,500,520,520
,Aggregated,1000,20,50,59.4,8.1,520.2,409.6,16.7,0.33,50,58,62,66,85,130,210,280,450,520,520
";

    #[test]
    fn test_parse_aggregate_row() {
        let metrics = parse_stats(STATS.as_bytes()).unwrap();

        assert_eq!(metrics.total_requests, 1000);
        assert_eq!(metrics.total_failures, 20);
        assert_eq!(metrics.avg_response_time, 59.4);
        assert_eq!(metrics.max_response_time, 520.2);
        assert_eq!(metrics.min_response_time, 8.1);
        assert_eq!(metrics.median_response_time, 50.0);
        assert_eq!(metrics.p95_response_time, 130.0);
        assert_eq!(metrics.p99_response_time, 280.0);
        assert_eq!(metrics.requests_per_second, 16.7);
        assert!((metrics.error_rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_not_available_cells_read_as_zero() {
        let csv = "\
Type,Name,Request Count,Failure Count,Median Response Time,Average Response Time,Min Response Time,Max Response Time,Requests/s,Failures/s
,Aggregated,0,0,N/A,0,N/A,N/A,0,0
";
        let metrics = parse_stats(csv.as_bytes()).unwrap();
        assert_eq!(metrics, ResultMetrics::default());
    }

    #[test]
    fn test_missing_aggregate_row() {
        let csv = "Type,Name,Request Count\nGET,/,5\n";
        assert!(matches!(
            parse_stats(csv.as_bytes()),
            Err(ResultsError::MissingAggregate)
        ));
        assert_eq!(ingest(Some(csv.as_bytes())), ResultMetrics::default());
    }

    #[test]
    fn test_missing_artifact_yields_zero_metrics() {
        assert_eq!(ingest(None), ResultMetrics::default());
        assert_eq!(ingest(Some(b"")), ResultMetrics::default());
    }
}
