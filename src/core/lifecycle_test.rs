use super::lifecycle::LifeCycle;
use super::lifecycle::LifeCycleState;

#[test]
fn test_full_legal_chain() {
    let lc = LifeCycle::new("n1");
    assert_eq!(lc.current(), LifeCycleState::New);

    assert!(lc.compare_and_transition(LifeCycleState::New, LifeCycleState::Starting));
    assert!(lc.compare_and_transition(LifeCycleState::Starting, LifeCycleState::Running));
    assert!(lc.is_running());
    assert!(lc.transition(LifeCycleState::Closing).is_ok());
    assert!(lc.transition(LifeCycleState::Closed).is_ok());
    assert!(lc.current().is_closing_or_closed());
}

#[test]
fn test_duplicate_start_rejected() {
    let lc = LifeCycle::new("n1");
    assert!(lc.compare_and_transition(LifeCycleState::New, LifeCycleState::Starting));
    // second start must not win the CAS
    assert!(!lc.compare_and_transition(LifeCycleState::New, LifeCycleState::Starting));
}

#[test]
fn test_never_started_closes_directly() {
    let lc = LifeCycle::new("n1");
    assert!(lc.transition(LifeCycleState::Closed).is_ok());
    assert_eq!(lc.current(), LifeCycleState::Closed);
}

#[test]
fn test_illegal_transition_fails() {
    let lc = LifeCycle::new("n1");
    assert!(lc.transition(LifeCycleState::Running).is_err());
    assert_eq!(lc.current(), LifeCycleState::New);
}

#[test]
fn test_assert_state() {
    let lc = LifeCycle::new("n1");
    assert!(lc.assert_state(&[LifeCycleState::New]).is_ok());
    assert!(lc.assert_state(&[LifeCycleState::Running]).is_err());

    lc.compare_and_transition(LifeCycleState::New, LifeCycleState::Starting);
    assert!(lc
        .assert_state(&[LifeCycleState::Starting, LifeCycleState::Running])
        .is_ok());
}
