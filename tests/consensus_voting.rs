use concord::agent::{spawn_agent, AgentDescriptor, Capability, LoopbackAgent, MessageKind, MessagePayload};
use concord::config::AppConfig;
use concord::consensus::{ConsensusMethod, ProposalStatus, Vote};
use concord::CoordinationRuntime;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> CoordinationRuntime {
    CoordinationRuntime::start(&AppConfig::default()).unwrap()
}

fn voter(runtime: &CoordinationRuntime, id: &str, vote: Option<Vote>) -> concord::AgentHandle {
    let agent = LoopbackAgent::new(id, &[Capability::RiskAssessment]);
    let agent = match vote {
        Some(vote) => agent.with_vote(vote),
        None => agent.without_vote(),
    };
    spawn_agent(runtime.hub.clone(), Arc::new(agent))
}

#[tokio::test]
async fn test_majority_approval_through_the_hub() {
    let runtime = runtime();
    let _voters = vec![
        voter(&runtime, "risk_1", Some(Vote::approve().with_confidence(0.9))),
        voter(&runtime, "risk_2", Some(Vote::approve())),
        voter(&runtime, "risk_3", Some(Vote::reject().with_rationale("too concentrated"))),
    ];

    let handle = runtime
        .consensus
        .initiate(
            "treasurer",
            "investment_approval",
            json!({"amount": 2_500_000, "instrument": "t-bill"}),
            &[Capability::RiskAssessment],
            ConsensusMethod::Majority,
            Some(Duration::from_secs(10)),
        )
        .await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.outcome())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, ProposalStatus::Approved);
    assert_eq!(outcome.votes.len(), 3);
    assert_eq!(outcome.summary.counts.approve, 2);
    assert_eq!(outcome.summary.counts.reject, 1);
    assert_eq!(outcome.summary.total_participants, 3);
    assert_eq!(runtime.consensus.active_count(), 0);
}

#[tokio::test]
async fn test_unanimous_rejected_by_single_dissent() {
    let runtime = runtime();
    let _voters = vec![
        voter(&runtime, "risk_1", None),
        voter(&runtime, "risk_2", Some(Vote::reject())),
    ];

    let handle = runtime
        .consensus
        .initiate(
            "treasurer",
            "emergency_funding",
            json!({}),
            &[Capability::RiskAssessment],
            ConsensusMethod::Unanimous,
            Some(Duration::from_secs(10)),
        )
        .await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.outcome())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, ProposalStatus::Rejected);
    assert_eq!(runtime.consensus.stats().rejected, 1);
}

#[tokio::test]
async fn test_silent_voters_time_out_and_initiator_is_told() {
    let runtime = runtime();
    let mut desk = runtime.hub.register(
        AgentDescriptor::new("treasurer", "treasury").subscribe(MessageKind::Notification),
    );
    let _voters = vec![
        voter(&runtime, "risk_1", None),
        voter(&runtime, "risk_2", None),
    ];

    let handle = runtime
        .consensus
        .initiate(
            "treasurer",
            "hedge_rollover",
            json!({}),
            &[Capability::RiskAssessment],
            ConsensusMethod::Majority,
            Some(Duration::from_millis(100)),
        )
        .await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.outcome())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, ProposalStatus::Timeout);
    assert!(outcome.votes.is_empty());

    let notice = tokio::time::timeout(Duration::from_secs(5), desk.recv())
        .await
        .unwrap()
        .unwrap();
    match notice.payload {
        MessagePayload::ConsensusTimedOut { proposal_id, .. } => {
            assert_eq!(proposal_id, handle.proposal_id())
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(runtime.consensus.stats().timed_out, 1);
}

#[tokio::test]
async fn test_initiator_is_not_asked_to_vote() {
    let runtime = runtime();
    let initiator = Arc::new(LoopbackAgent::new("risk_1", &[Capability::RiskAssessment]));
    let _initiator = spawn_agent(runtime.hub.clone(), initiator.clone());
    let _voters = vec![
        voter(&runtime, "risk_2", Some(Vote::approve())),
        voter(&runtime, "risk_3", Some(Vote::approve())),
        voter(&runtime, "risk_4", Some(Vote::approve())),
    ];

    let handle = runtime
        .consensus
        .initiate(
            "risk_1",
            "limit_change",
            json!({}),
            &[Capability::RiskAssessment],
            ConsensusMethod::Supermajority,
            Some(Duration::from_secs(10)),
        )
        .await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.outcome())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, ProposalStatus::Approved);
    assert!(!outcome.votes.contains_key("risk_1"));
    assert_eq!(initiator.proposals_seen(), 0);
}
