//! Integration tests against a live LLM endpoint.
//!
//! These tests make real API calls using the `LLM_*` environment variables
//! (a local Ollama server by default).
//! Run with: cargo test --test llm_integration -- --ignored

use std::sync::Arc;

use automl_forge::adapter::{
    AdaptContext, AlgorithmType, CodeAdapter, ColumnSchema, InitialContext, LlmCodeAdapter,
    SchemaContext, TableSchema,
};
use automl_forge::llm::{build_provider, GenerationRequest, LlmProvider, Message};
use automl_forge::settings::Settings;

fn create_test_provider() -> (Arc<dyn LlmProvider>, String) {
    let settings = Settings::from_env().expect("LLM_* environment variables must be valid");
    let provider = build_provider(&settings.llm).expect("LLM provider must be configured");
    (provider, settings.llm.model)
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let (provider, model) = create_test_provider();

    let request = GenerationRequest::new(
        model,
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = provider.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());

    let response = response.expect("Should have response");
    let content = response.text().expect("Should have content");
    assert!(
        content.contains('4'),
        "Response should contain '4', got: {}",
        content
    );
}

#[tokio::test]
#[ignore]
async fn test_adapter_produces_script() {
    let (provider, model) = create_test_provider();
    let adapter = LlmCodeAdapter::new(provider, model).with_temperature(0.0);

    let context = AdaptContext::Initial(InitialContext {
        schema: SchemaContext {
            tables: vec![TableSchema {
                name: "houses".to_string(),
                columns: vec![
                    ColumnSchema::new("rooms", "INTEGER"),
                    ColumnSchema::new("area", "REAL"),
                    ColumnSchema::new("price", "REAL"),
                ],
                row_count: Some(500),
            }],
            annotations: Some("price is the target".to_string()),
            data_source: Some("sqlite:///houses.db".to_string()),
        },
        algorithm: AlgorithmType::LinearRegression,
        objective: Some("Predict price".to_string()),
        eda_summary: None,
    });

    let code = adapter
        .adapt(&context)
        .await
        .expect("Adapter should return code");
    assert!(!code.contains("```"), "Fences should be stripped");
    assert!(code.contains("import"), "Expected a Python script, got: {}", code);
}
