//! End-to-end engine tests: fan-out over record-batch files on local disk,
//! filter + projection semantics, the row-cap contract, and response
//! round-tripping.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_ipc::reader::FileReader;
use arrow_ipc::writer::FileWriter;
use arrow_schema::{DataType, Field, Schema};
use tempfile::TempDir;

use varq_core::{
    Expression, FunctionRegistry, Literal, LocalFileReader, QueryEngine, QueryError, QueryRequest,
    QueryResponse,
};

/// One variant row of the test corpus.
struct VariantRow {
    xpos: i64,
    variant_id: &'static str,
    gnomad_af: Option<f64>,
    consequences: Option<Vec<&'static str>>,
}

fn variant_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("xpos", DataType::Int64, false),
        Field::new("variantId", DataType::Utf8, false),
        Field::new("gnomad_exomes_AF", DataType::Float64, true),
        Field::new(
            "consequences",
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
            true,
        ),
    ]))
}

fn variant_batch(rows: &[VariantRow]) -> RecordBatch {
    let xpos = Int64Array::from(rows.iter().map(|r| r.xpos).collect::<Vec<_>>());
    let variant_ids =
        StringArray::from(rows.iter().map(|r| r.variant_id).collect::<Vec<_>>());
    let afs = Float64Array::from(rows.iter().map(|r| r.gnomad_af).collect::<Vec<_>>());

    let mut consequences = ListBuilder::new(StringBuilder::new());
    for row in rows {
        match &row.consequences {
            Some(values) => {
                for value in values {
                    consequences.values().append_value(value);
                }
                consequences.append(true);
            }
            None => consequences.append(false),
        }
    }

    RecordBatch::try_new(
        variant_schema(),
        vec![
            Arc::new(xpos),
            Arc::new(variant_ids),
            Arc::new(afs),
            Arc::new(consequences.finish()),
        ],
    )
    .unwrap()
}

fn write_arrow_file(dir: &Path, name: &str, batches: &[RecordBatch]) -> String {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = FileWriter::try_new(file, batches[0].schema().as_ref()).unwrap();
    for batch in batches {
        writer.write(batch).unwrap();
    }
    writer.finish().unwrap();
    format!("file://{}", path.display())
}

fn engine() -> QueryEngine {
    QueryEngine::new(
        4,
        Arc::new(LocalFileReader::new()),
        Arc::new(FunctionRegistry::with_builtins().unwrap()),
    )
}

fn decode_response(response: &QueryResponse) -> Vec<RecordBatch> {
    if response.record_batches.is_empty() {
        return Vec::new();
    }
    let reader = FileReader::try_new(Cursor::new(response.record_batches.clone()), None).unwrap();
    reader.map(|b| b.unwrap()).collect()
}

/// The rare-damaging-variant filter used by the corpus tests: the gnomAD
/// exome frequency is below 1e-4 and at least one consequence is in the
/// lookup set.
fn rare_damaging_filter() -> Expression {
    Expression::call(
        "and_kleene",
        vec![
            Expression::call(
                "less",
                vec![
                    Expression::column("gnomad_exomes_AF"),
                    Expression::literal(Literal::double(0.0001)),
                ],
            ),
            Expression::call_with_set_lookup(
                "string_list_contains_any",
                vec![Expression::column("consequences")],
                vec![
                    "missense_variant".to_string(),
                    "frameshift_variant".to_string(),
                    "splice_donor_variant".to_string(),
                ],
            ),
        ],
    )
}

/// Two shards of chromosome-1 variants. Six rows survive the
/// rare-damaging filter; the rest fail the frequency bound, the
/// consequence lookup, or carry nulls.
fn write_variant_corpus(dir: &Path) -> Vec<String> {
    let shard1 = vec![
        VariantRow {
            xpos: 1001050069,
            variant_id: "1-1050069-G-A",
            gnomad_af: Some(0.00001),
            consequences: Some(vec!["missense_variant", "intron_variant"]),
        },
        VariantRow {
            xpos: 1001054900,
            variant_id: "1-1054900-C-T",
            gnomad_af: Some(0.00002),
            consequences: Some(vec!["frameshift_variant"]),
        },
        VariantRow {
            xpos: 1001060000,
            variant_id: "1-1060000-T-C",
            gnomad_af: Some(0.2),
            consequences: Some(vec!["missense_variant"]),
        },
        VariantRow {
            xpos: 1002024923,
            variant_id: "1-2024923-G-A",
            gnomad_af: Some(0.00005),
            consequences: Some(vec!["intron_variant", "splice_donor_variant"]),
        },
        VariantRow {
            xpos: 1002100000,
            variant_id: "1-2100000-A-T",
            gnomad_af: None,
            consequences: Some(vec!["missense_variant"]),
        },
        VariantRow {
            xpos: 1002302812,
            variant_id: "1-2302812-A-G",
            gnomad_af: Some(0.00003),
            consequences: Some(vec!["missense_variant"]),
        },
        VariantRow {
            xpos: 1002400000,
            variant_id: "1-2400000-C-G",
            gnomad_af: Some(0.00001),
            consequences: None,
        },
    ];
    let shard2 = vec![
        VariantRow {
            xpos: 1011000000,
            variant_id: "1-11000000-G-C",
            gnomad_af: Some(0.00004),
            consequences: Some(vec!["synonymous_variant"]),
        },
        VariantRow {
            xpos: 1011145001,
            variant_id: "1-11145001-C-T",
            gnomad_af: Some(0.00002),
            consequences: Some(vec!["splice_donor_variant"]),
        },
        VariantRow {
            xpos: 1011241657,
            variant_id: "1-11241657-A-G",
            gnomad_af: Some(0.00001),
            consequences: Some(vec!["intron_variant", "missense_variant"]),
        },
        VariantRow {
            xpos: 1011300000,
            variant_id: "1-11300000-T-A",
            gnomad_af: Some(0.5),
            consequences: Some(vec!["frameshift_variant"]),
        },
    ];
    vec![
        write_arrow_file(dir, "chr1_shard1.arrow", &[variant_batch(&shard1)]),
        write_arrow_file(dir, "chr1_shard2.arrow", &[variant_batch(&shard2)]),
    ]
}

#[test]
fn corpus_query_returns_the_six_expected_variants() {
    let dir = TempDir::new().unwrap();
    let request = QueryRequest {
        arrow_urls: write_variant_corpus(dir.path()),
        projection_columns: vec!["xpos".to_string(), "variantId".to_string()],
        filter_expression: rare_damaging_filter(),
        max_rows: 10000,
    };

    let response = engine().query(&request).unwrap();
    assert_eq!(response.num_rows, 6);

    let batches = decode_response(&response);
    let decoded_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(decoded_rows as u64, response.num_rows);

    // Result columns equal the projection, in order.
    for batch in &batches {
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(0).name(), "xpos");
        assert_eq!(batch.schema().field(1).name(), "variantId");
    }

    let mut actual = HashSet::new();
    let mut in_order = Vec::new();
    for batch in &batches {
        let xpos = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        let variant_ids = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        for i in 0..batch.num_rows() {
            assert!(!xpos.is_null(i));
            assert!(!variant_ids.is_null(i));
            actual.insert((xpos.value(i), variant_ids.value(i).to_string()));
            in_order.push(xpos.value(i));
        }
    }

    // Values validated against the source dataset.
    let expected: HashSet<(i64, String)> = [
        (1001050069, "1-1050069-G-A"),
        (1001054900, "1-1054900-C-T"),
        (1002024923, "1-2024923-G-A"),
        (1002302812, "1-2302812-A-G"),
        (1011145001, "1-11145001-C-T"),
        (1011241657, "1-11241657-A-G"),
    ]
    .into_iter()
    .map(|(x, v)| (x, v.to_string()))
    .collect();
    assert_eq!(actual, expected);

    // Batches arrive in URL order: shard 1's rows precede shard 2's.
    let sorted = {
        let mut s = in_order.clone();
        s.sort_unstable();
        s
    };
    assert_eq!(in_order, sorted);
}

#[test]
fn exceeding_the_row_cap_cancels_the_query() {
    let dir = TempDir::new().unwrap();
    let make_rows = |base: i64| -> Vec<VariantRow> {
        (0..10)
            .map(|i| VariantRow {
                xpos: base + i,
                variant_id: "1-1-A-C",
                gnomad_af: Some(0.0),
                consequences: Some(vec!["missense_variant"]),
            })
            .collect()
    };
    let urls = vec![
        write_arrow_file(dir.path(), "a.arrow", &[variant_batch(&make_rows(1000))]),
        write_arrow_file(dir.path(), "b.arrow", &[variant_batch(&make_rows(2000))]),
    ];

    let request = QueryRequest {
        arrow_urls: urls,
        projection_columns: vec!["xpos".to_string()],
        filter_expression: rare_damaging_filter(),
        max_rows: 15,
    };

    let err = engine().query(&request).unwrap_err();
    assert!(matches!(err, QueryError::Cancelled(_)));
    assert!(err.to_string().contains("15"));
}

#[test]
fn cancellation_takes_priority_over_per_url_failures() {
    let dir = TempDir::new().unwrap();
    let rows: Vec<VariantRow> = (0..20)
        .map(|i| VariantRow {
            xpos: 1000 + i,
            variant_id: "1-1-A-C",
            gnomad_af: Some(0.0),
            consequences: Some(vec!["missense_variant"]),
        })
        .collect();
    let good = write_arrow_file(dir.path(), "good.arrow", &[variant_batch(&rows)]);

    let request = QueryRequest {
        arrow_urls: vec!["http://x".to_string(), good],
        projection_columns: vec!["xpos".to_string()],
        filter_expression: rare_damaging_filter(),
        max_rows: 10,
    };

    let err = engine().query(&request).unwrap_err();
    assert!(matches!(err, QueryError::Cancelled(_)));
}

#[test]
fn empty_result_is_ok_with_zero_rows() {
    let dir = TempDir::new().unwrap();
    let rows = vec![VariantRow {
        xpos: 1001050069,
        variant_id: "1-1050069-G-A",
        gnomad_af: Some(0.9),
        consequences: Some(vec!["intron_variant"]),
    }];
    let url = write_arrow_file(dir.path(), "common.arrow", &[variant_batch(&rows)]);

    let request = QueryRequest {
        arrow_urls: vec![url],
        projection_columns: vec!["xpos".to_string(), "variantId".to_string()],
        filter_expression: rare_damaging_filter(),
        max_rows: 100,
    };

    let response = engine().query(&request).unwrap();
    assert_eq!(response.num_rows, 0);
    assert!(response.record_batches.is_empty());
}

#[test]
fn unsupported_url_scheme_is_invalid_argument() {
    let request = QueryRequest {
        arrow_urls: vec!["http://x".to_string()],
        projection_columns: vec!["xpos".to_string()],
        filter_expression: rare_damaging_filter(),
        max_rows: 100,
    };

    let err = engine().query(&request).unwrap_err();
    assert!(matches!(err, QueryError::InvalidArgument(_)));
    assert!(err.to_string().contains("http://x"));
}

#[test]
fn multiple_batches_per_file_are_emitted_in_order() {
    let dir = TempDir::new().unwrap();
    let row = |xpos: i64| VariantRow {
        xpos,
        variant_id: "1-1-A-C",
        gnomad_af: Some(0.0),
        consequences: Some(vec!["missense_variant"]),
    };
    let url = write_arrow_file(
        dir.path(),
        "chunked.arrow",
        &[
            variant_batch(&[row(1), row(2)]),
            variant_batch(&[row(3)]),
        ],
    );

    let request = QueryRequest {
        arrow_urls: vec![url],
        projection_columns: vec!["xpos".to_string()],
        filter_expression: rare_damaging_filter(),
        max_rows: 100,
    };

    let response = engine().query(&request).unwrap();
    assert_eq!(response.num_rows, 3);

    let batches = decode_response(&response);
    assert_eq!(batches.len(), 2);
    let mut seen = Vec::new();
    for batch in &batches {
        let xpos = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        for i in 0..batch.num_rows() {
            seen.push(xpos.value(i));
        }
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

#[test]
fn mismatched_schemas_across_urls_fail_assembly() {
    let dir = TempDir::new().unwrap();

    let rows = vec![VariantRow {
        xpos: 1,
        variant_id: "1-1-A-C",
        gnomad_af: Some(0.0),
        consequences: Some(vec!["missense_variant"]),
    }];
    let url_a = write_arrow_file(dir.path(), "a.arrow", &[variant_batch(&rows)]);

    // Same column name, different type: survives its own scan but cannot
    // join the output stream.
    let schema_b = Arc::new(Schema::new(vec![Field::new("xpos", DataType::Utf8, false)]));
    let batch_b = RecordBatch::try_new(
        schema_b,
        vec![Arc::new(StringArray::from(vec!["not-an-xpos"]))],
    )
    .unwrap();
    let url_b = write_arrow_file(dir.path(), "b.arrow", &[batch_b]);

    let request = QueryRequest {
        arrow_urls: vec![url_a, url_b],
        projection_columns: vec!["xpos".to_string()],
        filter_expression: Expression::literal(Literal::bool(true)),
        max_rows: 100,
    };

    let err = engine().query(&request).unwrap_err();
    assert!(matches!(err, QueryError::InvalidArgument(_)));
    assert!(err.to_string().contains("does not match"));
}

#[test]
fn later_urls_fail_fast_once_the_cap_is_blown() {
    let dir = TempDir::new().unwrap();
    let rows: Vec<VariantRow> = (0..10)
        .map(|i| VariantRow {
            xpos: i,
            variant_id: "1-1-A-C",
            gnomad_af: Some(0.0),
            consequences: Some(vec!["missense_variant"]),
        })
        .collect();
    let url = write_arrow_file(dir.path(), "w.arrow", &[variant_batch(&rows)]);

    // A single worker serializes the URLs, so the second and third scans
    // see the blown counter before starting.
    let single = QueryEngine::new(
        1,
        Arc::new(LocalFileReader::new()),
        Arc::new(FunctionRegistry::with_builtins().unwrap()),
    );
    let request = QueryRequest {
        arrow_urls: vec![url.clone(), url.clone(), url],
        projection_columns: vec!["xpos".to_string()],
        filter_expression: rare_damaging_filter(),
        max_rows: 5,
    };

    let err = single.query(&request).unwrap_err();
    assert!(matches!(err, QueryError::Cancelled(_)));
    assert!(err.to_string().contains("5"));
}
