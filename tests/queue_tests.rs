use hostlink::queue::{PriorityBank, QueueError, Wake};
use hostlink::{BufferHandle, InterfaceType, OwnerToken, Priority};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn data(byte: u8) -> BufferHandle {
    BufferHandle::copy_owned(InterfaceType::Sta, 0, vec![byte])
}

#[test]
fn test_highest_priority_first_fifo_within_priority() {
    let bank = PriorityBank::new("tx", 3, 8);
    bank.enqueue(Priority::new(2), data(20)).unwrap();
    bank.enqueue(Priority::new(1), data(10)).unwrap();
    bank.enqueue(Priority::new(2), data(21)).unwrap();
    bank.enqueue(Priority::HIGHEST, data(0)).unwrap();

    let order: Vec<u8> = std::iter::from_fn(|| bank.try_dequeue_highest())
        .map(|(_, handle)| handle.payload()[0])
        .collect();
    assert_eq!(order, vec![0, 10, 20, 21]);
    assert!(bank.is_empty());
}

#[test]
fn test_full_queue_hands_back_the_buffer() {
    let bank = PriorityBank::new("rx", 1, 2);
    bank.enqueue(Priority::HIGHEST, data(1)).unwrap();
    bank.enqueue(Priority::HIGHEST, data(2)).unwrap();

    let err = bank.enqueue(Priority::HIGHEST, data(3)).unwrap_err();
    assert!(err.is_full());
    assert_eq!(err.into_handle().payload(), &[3]);
    assert_eq!(bank.len(), 2);
}

#[test]
fn test_invalid_priority_releases_buffer() {
    let bank = PriorityBank::new("tx", 2, 4);
    let released = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&released);
    let handle = BufferHandle::zero_copy(InterfaceType::Hci, 0, Arc::from(&b"x"[..]), OwnerToken(1), move |_| {
        hook.fetch_add(1, Ordering::SeqCst);
    });

    let err = bank.enqueue(Priority::new(5), handle).unwrap_err();
    assert!(matches!(err, QueueError::InvalidPriority { .. }));
    drop(err);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wait_wakes_on_enqueue_and_times_out_when_idle() {
    let bank = Arc::new(PriorityBank::new("tx", 3, 8));
    assert_eq!(bank.wait(Some(Duration::from_millis(10))).await, Wake::TimedOut);

    let producer = Arc::clone(&bank);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.enqueue(Priority::new(1), data(7)).unwrap();
    });

    assert_eq!(bank.wait(Some(Duration::from_secs(1))).await, Wake::Signalled);
    assert_eq!(bank.try_dequeue(Priority::new(1)).map(|h| h.payload()[0]), Some(7));
}

#[tokio::test]
async fn test_drain_releases_everything_and_close_wakes_waiters() {
    let bank = Arc::new(PriorityBank::new("rx", 2, 4));
    let released = Arc::new(AtomicUsize::new(0));
    for i in 0..3u8 {
        let hook = Arc::clone(&released);
        bank.enqueue(
            Priority::new(i % 2),
            BufferHandle::copy_owned(InterfaceType::Serial, 0, vec![i]).on_release(move |_| {
                hook.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    }

    assert_eq!(bank.drain_all(), 3);
    assert_eq!(released.load(Ordering::SeqCst), 3);

    let waiter = Arc::clone(&bank);
    let task = tokio::spawn(async move { waiter.wait(None).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    bank.close();
    // Counts left by the drained enqueues can satisfy this wait first.
    let wake = task.await.unwrap();
    assert!(matches!(wake, Wake::Signalled | Wake::Closed));
    assert_eq!(bank.wait(None).await, Wake::Closed);
}
