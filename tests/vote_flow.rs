//! End-to-end voting flows through the engine and store:
//! create → vote → aggregate → edit → withdraw.

mod common;

use ballotbox::engine::{BulkVote, VoteError, VoteItem, VoteRejection};
use ballotbox::model::{PollFlags, PollKind, VoteResponse};
use ballotbox::results::aggregate;
use chrono::{Duration, Utc};
use common::{test_app, text_option};

fn bulk(name: &str, email: &str, items: Vec<(i64, VoteResponse)>) -> BulkVote {
    BulkVote {
        voter_name: name.into(),
        voter_email: email.into(),
        items: items
            .into_iter()
            .map(|(option_id, response)| VoteItem {
                option_id,
                response,
                comment: None,
            })
            .collect(),
        is_test_data: false,
    }
}

#[tokio::test]
async fn survey_happy_path() {
    let app = test_app().await;
    let poll = app
        .create_poll(
            PollKind::Survey,
            PollFlags {
                allow_maybe: true,
                ..PollFlags::default()
            },
            vec![text_option("A"), text_option("B"), text_option("C")],
        )
        .await;
    let (o1, o2, o3) = (poll.options[0].id, poll.options[1].id, poll.options[2].id);

    let receipt = app
        .engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk(
                "V1",
                "v1@x.test",
                vec![
                    (o1, VoteResponse::Yes),
                    (o2, VoteResponse::No),
                    (o3, VoteResponse::Maybe),
                ],
            ),
        )
        .await
        .expect("vote succeeds");

    assert_eq!(receipt.votes.len(), 3);
    // Editing is off, so no edit token is handed out.
    assert!(receipt.voter_edit_token.is_none());

    let agg = app.store.poll_by_id(poll.poll.id).await.unwrap().unwrap();
    let results = aggregate(&agg);
    assert_eq!(results.stats[&o1].yes_count, 1);
    assert_eq!(results.stats[&o3].maybe_count, 1);
    assert_eq!(results.participant_count, 1);
    assert_eq!(results.response_rate, 100);
}

#[tokio::test]
async fn ten_sequential_voters_all_counted() {
    let app = test_app().await;
    let poll = app
        .create_poll(PollKind::Survey, PollFlags::default(), vec![text_option("A")])
        .await;
    let option = poll.options[0].id;

    for i in 0..10 {
        app.engine
            .submit(
                &poll.poll.public_token,
                &app.anon_voter(),
                bulk(
                    &format!("V{}", i),
                    &format!("v{}@x.test", i),
                    vec![(option, VoteResponse::Yes)],
                ),
            )
            .await
            .expect("each voter succeeds");
    }

    let agg = app.store.poll_by_id(poll.poll.id).await.unwrap().unwrap();
    let results = aggregate(&agg);
    assert_eq!(results.stats[&option].yes_count, 10);
    assert_eq!(results.participant_count, 10);
}

#[tokio::test]
async fn maybe_requires_the_flag() {
    let app = test_app().await;
    let poll = app
        .create_poll(PollKind::Survey, PollFlags::default(), vec![text_option("A")])
        .await;

    let err = app
        .engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk("V", "v@x.test", vec![(poll.options[0].id, VoteResponse::Maybe)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::MaybeNotAllowed)
    ));
}

#[tokio::test]
async fn unknown_option_is_rejected() {
    let app = test_app().await;
    let poll = app
        .create_poll(PollKind::Survey, PollFlags::default(), vec![text_option("A")])
        .await;

    let err = app
        .engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk("V", "v@x.test", vec![(99999, VoteResponse::Yes)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::UnknownOption { option_id: 99999 })
    ));
}

#[tokio::test]
async fn survey_revote_without_edit_is_duplicate() {
    let app = test_app().await;
    let poll = app
        .create_poll(PollKind::Survey, PollFlags::default(), vec![text_option("A")])
        .await;
    let option = poll.options[0].id;

    app.engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk("V", "v@x.test", vec![(option, VoteResponse::Yes)]),
        )
        .await
        .unwrap();

    let err = app
        .engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk("V", "V@X.TEST", vec![(option, VoteResponse::No)]),
        )
        .await
        .unwrap_err();
    // Email comparison is case-insensitive; surveys report the duplicate
    // variant.
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::DuplicateEmailVote)
    ));
}

#[tokio::test]
async fn edit_flow_updates_counts() {
    let app = test_app().await;
    let poll = app
        .create_poll(
            PollKind::Survey,
            PollFlags {
                allow_vote_edit: true,
                ..PollFlags::default()
            },
            vec![text_option("A")],
        )
        .await;
    let option = poll.options[0].id;

    let receipt = app
        .engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk("V", "v@x.test", vec![(option, VoteResponse::Yes)]),
        )
        .await
        .unwrap();
    let edit_token = receipt.voter_edit_token.expect("edit token issued");

    // The token finds exactly the submitted rows.
    let owned = app.store.votes_by_edit_token(&edit_token).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].option_id, option);
    assert_eq!(owned[0].response, VoteResponse::Yes);

    app.engine
        .update_by_edit_token(
            &edit_token,
            vec![VoteItem {
                option_id: option,
                response: VoteResponse::No,
                comment: None,
            }],
        )
        .await
        .expect("edit succeeds");

    let agg = app.store.poll_by_id(poll.poll.id).await.unwrap().unwrap();
    let results = aggregate(&agg);
    assert_eq!(results.stats[&option].yes_count, 0);
    assert_eq!(results.stats[&option].no_count, 1);
    assert_eq!(results.participant_count, 1);
}

#[tokio::test]
async fn edit_tokens_are_shared_across_a_voters_rows() {
    let app = test_app().await;
    let poll = app
        .create_poll(
            PollKind::Survey,
            PollFlags {
                allow_vote_edit: true,
                ..PollFlags::default()
            },
            vec![text_option("A"), text_option("B")],
        )
        .await;

    app.engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk(
                "V",
                "v@x.test",
                vec![
                    (poll.options[0].id, VoteResponse::Yes),
                    (poll.options[1].id, VoteResponse::No),
                ],
            ),
        )
        .await
        .unwrap();

    let agg = app.store.poll_by_id(poll.poll.id).await.unwrap().unwrap();
    let tokens: std::collections::HashSet<_> =
        agg.votes.iter().map(|v| v.voter_edit_token.clone()).collect();
    assert_eq!(tokens.len(), 1, "one voter, one edit token");
    let emails: std::collections::HashSet<_> =
        agg.votes.iter().map(|v| v.voter_email.clone()).collect();
    assert_eq!(emails.len(), 1);
}

#[tokio::test]
async fn registered_email_requires_login() {
    let app = test_app().await;
    app.store.create_user("member@x.test", None).await.unwrap();
    let poll = app
        .create_poll(PollKind::Survey, PollFlags::default(), vec![text_option("A")])
        .await;

    let err = app
        .engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk("M", "member@x.test", vec![(poll.options[0].id, VoteResponse::Yes)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::RequiresLogin)
    ));
}

#[tokio::test]
async fn closed_polls_reject_mutations() {
    let app = test_app().await;
    let poll = app
        .create_poll(PollKind::Survey, PollFlags::default(), vec![text_option("A")])
        .await;

    // Expire it just in the past, as an admin PATCH would.
    let mut updated = poll.poll.clone();
    updated.expires_at = Some(Utc::now() - Duration::seconds(1));
    app.store.update_poll(&updated).await.unwrap();

    let err = app
        .engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk("V", "v@x.test", vec![(poll.options[0].id, VoteResponse::Yes)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::PollExpired)
    ));

    // Deactivation closes too, with its own reason.
    let mut deactivated = poll.poll.clone();
    deactivated.expires_at = None;
    deactivated.is_active = false;
    app.store.update_poll(&deactivated).await.unwrap();

    let err = app
        .engine
        .submit(
            &poll.poll.public_token,
            &app.anon_voter(),
            bulk("V", "v@x.test", vec![(poll.options[0].id, VoteResponse::Yes)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::PollInactive)
    ));

    // No rows slipped through.
    let agg = app.store.poll_by_id(poll.poll.id).await.unwrap().unwrap();
    assert!(agg.votes.is_empty());
}

#[tokio::test]
async fn withdrawal_is_once_then_not_found() {
    let app = test_app().await;
    let poll = app
        .create_poll(
            PollKind::Survey,
            PollFlags {
                allow_vote_edit: true,
                allow_vote_withdrawal: true,
                ..PollFlags::default()
            },
            vec![text_option("A")],
        )
        .await;

    let voter = app.anon_voter();
    let receipt = app
        .engine
        .submit(
            &poll.poll.public_token,
            &voter,
            bulk("V", "v@x.test", vec![(poll.options[0].id, VoteResponse::Yes)]),
        )
        .await
        .unwrap();
    let edit_token = receipt.voter_edit_token.unwrap();

    let removed = app
        .engine
        .withdraw(&poll.poll.public_token, &voter, None, Some(&edit_token))
        .await
        .expect("first withdrawal succeeds");
    assert_eq!(removed, 1);

    let err = app
        .engine
        .withdraw(&poll.poll.public_token, &voter, None, Some(&edit_token))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::NoVotesFound)
    ));
}

#[tokio::test]
async fn withdrawal_requires_the_flag() {
    let app = test_app().await;
    let poll = app
        .create_poll(PollKind::Survey, PollFlags::default(), vec![text_option("A")])
        .await;

    let voter = app.anon_voter();
    app.engine
        .submit(
            &poll.poll.public_token,
            &voter,
            bulk("V", "v@x.test", vec![(poll.options[0].id, VoteResponse::Yes)]),
        )
        .await
        .unwrap();

    let err = app
        .engine
        .withdraw(&poll.poll.public_token, &voter, Some("v@x.test"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::WithdrawalNotAllowed)
    ));
}

#[tokio::test]
async fn email_only_withdrawal_is_bound_to_the_device() {
    let app = test_app().await;
    let poll = app
        .create_poll(
            PollKind::Survey,
            PollFlags {
                allow_vote_withdrawal: true,
                ..PollFlags::default()
            },
            vec![text_option("A")],
        )
        .await;

    let voter = app.anon_voter();
    app.engine
        .submit(
            &poll.poll.public_token,
            &voter,
            bulk("V", "v@x.test", vec![(poll.options[0].id, VoteResponse::Yes)]),
        )
        .await
        .unwrap();

    // A different browser supplying only the email is refused.
    let stranger = app.anon_voter();
    let err = app
        .engine
        .withdraw(&poll.poll.public_token, &stranger, Some("v@x.test"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoteError::Rejected(VoteRejection::NoVotesFound)
    ));

    // The original device succeeds.
    let removed = app
        .engine
        .withdraw(&poll.poll.public_token, &voter, Some("v@x.test"), None)
        .await
        .unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn confirmation_email_respects_cooldown() {
    let app = test_app().await;
    let poll = app
        .create_poll(
            PollKind::Survey,
            PollFlags {
                allow_vote_edit: true,
                ..PollFlags::default()
            },
            vec![text_option("A"), text_option("B")],
        )
        .await;

    let voter = app.anon_voter();
    app.engine
        .submit(
            &poll.poll.public_token,
            &voter,
            bulk("V", "v@x.test", vec![(poll.options[0].id, VoteResponse::Yes)]),
        )
        .await
        .unwrap();
    // Immediate second submission (an edit) stays inside the 30 s window.
    app.engine
        .submit(
            &poll.poll.public_token,
            &voter,
            bulk("V", "v@x.test", vec![(poll.options[1].id, VoteResponse::Yes)]),
        )
        .await
        .unwrap();

    // The send task is spawned; give it a moment.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(app.mailer.sent_to("v@x.test"), 1);
}
