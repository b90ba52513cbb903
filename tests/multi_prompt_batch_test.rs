//! Multi-prompt fan-out, batch constraints and persistence through the service

mod common;

use annotext_core::error::AnnotextError;
use annotext_core::pipeline::MultiPromptCoordinator;
use annotext_core::services::gateway::CompletionPurpose;
use annotext_core::{
    AnnotationCategory, AnnotationService, BatchConstraints, BatchMode, BatchStatus, PromptSet,
    PromptSpec, RunOrchestrator, RunStage, SourceDocument, Thoroughness,
};
use common::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn three_prompts() -> PromptSet {
    PromptSet::new(vec![
        PromptSpec::new("harbour finance"),
        PromptSpec::new("council decisions").with_color("#112233"),
        PromptSpec::new("levy opposition"),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_three_prompts_produce_independent_tagged_sets() {
    let gateway = Arc::new(ScriptedGateway::echo());
    let orchestrator = RunOrchestrator::new(gateway.clone(), Arc::new(test_config()));
    let doc = SourceDocument::new("doc", &sentence_document(20));
    let prompts = three_prompts();

    let report = MultiPromptCoordinator::new(orchestrator)
        .analyze(&doc, &prompts, Thoroughness::Exhaustive, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.failures.is_empty());
    assert_eq!(report.runs.len(), 3);
    let run_ids: HashSet<_> = report.runs.iter().map(|r| r.run.id).collect();
    assert_eq!(run_ids.len(), 3);

    let colors: Vec<String> = prompts.iter().map(|(tag, _)| tag.color.clone()).collect();
    assert_eq!(colors[1], "#112233");
    assert_eq!(colors.iter().collect::<HashSet<_>>().len(), 3);

    let per_prompt: Vec<Vec<(usize, usize)>> = (0..3)
        .map(|i| {
            report
                .for_prompt(i)
                .map(|a| {
                    assert_eq!(a.prompt_color.as_deref(), Some(colors[i].as_str()));
                    assert_eq!(a.analysis_run_id, report.runs[i].run.id);
                    assert_annotation_invariants(&doc, a);
                    (a.final_start, a.final_end)
                })
                .collect()
        })
        .collect();

    // Same spans under every prompt: overlaps across prompts are kept
    assert!(!per_prompt[0].is_empty());
    let mut first = per_prompt[0].clone();
    first.sort();
    for spans in &per_prompt[1..] {
        let mut spans = spans.clone();
        spans.sort();
        assert_eq!(spans, first);
    }
    assert_eq!(report.annotations.len(), 3 * per_prompt[0].len());
}

#[tokio::test]
async fn test_failing_prompt_is_reported_without_sinking_the_others() {
    let gateway = Arc::new(ScriptedGateway::new("picky", |request| {
        if request.purpose == CompletionPurpose::Generate
            && request.prompt.contains("levy opposition")
        {
            return Err(AnnotextError::LlmApi(
                "API request failed with status 400: prompt refused".to_string(),
            ));
        }
        echo_response(request)
    }));
    let orchestrator = RunOrchestrator::new(gateway, Arc::new(test_config()));
    let doc = SourceDocument::new("doc", &sentence_document(10));

    let report = MultiPromptCoordinator::new(orchestrator)
        .analyze(&doc, &three_prompts(), Thoroughness::Exhaustive, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.runs.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].prompt_index, 2);
    assert_eq!(report.for_prompt(2).count(), 0);
    assert!(report.for_prompt(0).count() > 0);
    assert!(report.for_prompt(1).count() > 0);
}

#[tokio::test]
async fn test_every_prompt_failing_is_an_error() {
    let gateway = Arc::new(ScriptedGateway::failing("down", || {
        AnnotextError::LlmApi("API request failed with status 403".to_string())
    }));
    let orchestrator = RunOrchestrator::new(gateway, Arc::new(test_config()));
    let doc = SourceDocument::new("doc", &sentence_document(10));

    let err = MultiPromptCoordinator::new(orchestrator)
        .analyze(&doc, &three_prompts(), Thoroughness::Exhaustive, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AnnotextError::RunFailed { .. }));
}

#[tokio::test]
async fn test_service_persists_single_and_multi_prompt_runs() {
    let store = create_test_store(&[("minutes", sentence_document(12).as_str())]).await;
    let service = AnnotationService::new(
        store.clone(),
        Arc::new(ScriptedGateway::echo()),
        test_config(),
    );

    let report = service
        .analyze_document("minutes", "harbour levy", Thoroughness::Exhaustive)
        .await
        .unwrap();
    assert_eq!(report.status, RunStage::Complete);
    let stored = store.runs_for("minutes").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].run.id, report.run.id);
    assert_eq!(stored[0].annotations.len(), report.annotations.len());

    let multi = service
        .analyze_multi_prompt(
            "minutes",
            vec![PromptSpec::new("harbour"), PromptSpec::new("council")],
            Thoroughness::Exhaustive,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(multi.runs.len(), 2);
    assert_eq!(store.runs_for("minutes").await.len(), 3);
    assert_eq!(
        store.annotation_count("minutes").await,
        report.annotations.len() + multi.annotations.len()
    );
}

#[tokio::test]
async fn test_background_run_is_persisted_on_finish() {
    let store = create_test_store(&[("minutes", sentence_document(12).as_str())]).await;
    let service = AnnotationService::new(
        store.clone(),
        Arc::new(ScriptedGateway::echo()),
        test_config(),
    );

    let handle = service
        .start_analysis("minutes", "harbour levy", Thoroughness::Exhaustive)
        .await
        .unwrap();
    let run_id = handle.run_id();
    let report = service.finish(handle).await.unwrap();

    assert_eq!(report.run.id, run_id);
    let stored = store.runs_for("minutes").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].run.id, run_id);
}

#[tokio::test]
async fn test_batch_reports_status_per_document() {
    let good = sentence_document(20);
    let shaky = sentence_document(20).replace("Entry", "Ledger");
    let store = create_test_store(&[("good", good.as_str()), ("shaky", shaky.as_str())]).await;

    // The first chunk of "shaky" is the only excerpt starting with this sentence
    let gateway = Arc::new(ScriptedGateway::new("batch", |request| {
        if request.purpose == CompletionPurpose::Generate
            && excerpt(&request.prompt).starts_with("Ledger 000")
        {
            return Err(AnnotextError::LlmApi(
                "API request failed with status 400".to_string(),
            ));
        }
        echo_response(request)
    }));
    let service = AnnotationService::new(store.clone(), gateway, test_config());

    let ids = vec![
        "good".to_string(),
        "shaky".to_string(),
        "ghost".to_string(),
        "good".to_string(),
    ];
    let constraints = BatchConstraints {
        categories: vec![AnnotationCategory::Evidence],
        max_per_document: Some(3),
        min_confidence: Some(0.5),
    };
    let results = service
        .batch_analyze(
            &ids,
            &BatchMode::Intent("harbour levy".to_string()),
            &constraints,
            Thoroughness::Exhaustive,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(results.len(), 3);

    let good_result = &results["good"];
    assert_eq!(good_result.status, BatchStatus::Succeeded);
    assert_eq!(good_result.retained, 3);
    assert_eq!(good_result.annotations.len(), 3);
    assert!(good_result
        .annotations
        .windows(2)
        .all(|w| w[0].final_start <= w[1].final_start));
    assert_eq!(store.annotation_count("good").await, 3);
    assert_eq!(store.runs_for("good").await.len(), 1);

    let shaky_result = &results["shaky"];
    assert_eq!(shaky_result.status, BatchStatus::PartiallyFailed);
    assert_eq!(shaky_result.failed_chunks, 1);
    assert!(shaky_result.retained > 0);

    let ghost = &results["ghost"];
    assert_eq!(ghost.status, BatchStatus::Failed);
    assert!(ghost.error.as_deref().unwrap_or_default().contains("ghost"));
    assert!(store.runs_for("ghost").await.is_empty());
}

#[tokio::test]
async fn test_batch_category_filter_can_retain_nothing() {
    let store = create_test_store(&[("doc", sentence_document(10).as_str())]).await;
    let service = AnnotationService::new(
        store.clone(),
        Arc::new(ScriptedGateway::echo()),
        test_config(),
    );
    let constraints = BatchConstraints {
        categories: vec![AnnotationCategory::Argument],
        ..Default::default()
    };

    let results = service
        .batch_analyze(
            &["doc".to_string()],
            &BatchMode::Prompts(three_prompts()),
            &constraints,
            Thoroughness::Exhaustive,
            &CancellationToken::new(),
        )
        .await;

    let result = &results["doc"];
    assert_eq!(result.status, BatchStatus::Succeeded);
    assert_eq!(result.retained, 0);
    assert_eq!(result.runs.len(), 3);
    // Runs are still recorded even when every annotation is filtered out
    assert_eq!(store.runs_for("doc").await.len(), 3);
    assert_eq!(store.annotation_count("doc").await, 0);
}
