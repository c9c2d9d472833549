//! The pick family: keep the entries whose transform output is truthy.
//!
//! All three variants run on the [`Executor`] and differ only in the limit:
//! unbounded, one at a time, or caller supplied. The output is always a
//! [`Keyed`] container holding the original values under their original keys,
//! whatever the shape of the source.

use std::sync::Arc;

use crate::collection::{Collected, Keyed, OrderedView};
use crate::completion::Completion;
use crate::core::Key;
use crate::executor::{Executor, Limit};
use crate::handle::{Outcome, RunHandle};

/// How a transform output is read as a keep/drop decision.
pub trait Truthy {
    fn is_truthy(&self) -> bool;
}

impl Truthy for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

macro_rules! truthy_int {
    ($($ty:ty),*) => {
        $(
            impl Truthy for $ty {
                fn is_truthy(&self) -> bool {
                    *self != 0
                }
            }
        )*
    };
}

truthy_int!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

impl Truthy for f32 {
    fn is_truthy(&self) -> bool {
        *self != 0.0 && !self.is_nan()
    }
}

impl Truthy for f64 {
    fn is_truthy(&self) -> bool {
        *self != 0.0 && !self.is_nan()
    }
}

impl Truthy for str {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for String {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T: Truthy + ?Sized> Truthy for &T {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl<T: Truthy> Truthy for Option<T> {
    fn is_truthy(&self) -> bool {
        self.as_ref().is_some_and(Truthy::is_truthy)
    }
}

fn picked<V>(collected: Collected<Option<V>>) -> Keyed<V> {
    collected
        .into_keyed()
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .collect()
}

fn project<V>(outcome: Outcome<Collected<Option<V>>>) -> Outcome<Keyed<V>> {
    outcome.map(picked).map_err(|err| err.map_partial(picked))
}

impl<C> Executor<C>
where
    C: Send + Sync + 'static,
{
    /// Tests every entry at once.
    pub fn pick<V, O, F>(&self, view: impl Into<OrderedView<V>>, transform: F) -> RunHandle<Keyed<V>>
    where
        V: Clone + Send + 'static,
        O: Truthy + 'static,
        F: Fn(&C, V, &Key, Completion<O>) + Send + Sync + 'static,
    {
        self.pick_limit(view, Limit::Unbounded, transform)
    }

    /// Tests one entry at a time, in source order.
    pub fn pick_series<V, O, F>(
        &self,
        view: impl Into<OrderedView<V>>,
        transform: F,
    ) -> RunHandle<Keyed<V>>
    where
        V: Clone + Send + 'static,
        O: Truthy + 'static,
        F: Fn(&C, V, &Key, Completion<O>) + Send + Sync + 'static,
    {
        self.pick_limit(view, Limit::SERIES, transform)
    }

    /// Tests at most `limit` entries at a time.
    pub fn pick_limit<V, O, F>(
        &self,
        view: impl Into<OrderedView<V>>,
        limit: impl Into<Limit>,
        transform: F,
    ) -> RunHandle<Keyed<V>>
    where
        V: Clone + Send + 'static,
        O: Truthy + 'static,
        F: Fn(&C, V, &Key, Completion<O>) + Send + Sync + 'static,
    {
        let (finish, handle) = RunHandle::channel();
        self.pick_with(view, limit, transform, finish);
        handle
    }

    /// Callback form of [`Executor::pick_limit`].
    pub fn pick_with<V, O, F, D>(
        &self,
        view: impl Into<OrderedView<V>>,
        limit: impl Into<Limit>,
        transform: F,
        on_done: D,
    ) where
        V: Clone + Send + 'static,
        O: Truthy + 'static,
        F: Fn(&C, V, &Key, Completion<O>) + Send + Sync + 'static,
        D: FnOnce(Outcome<Keyed<V>>) + Send + 'static,
    {
        let select = move |ctx: &C, value: V, key: &Key, done: Completion<Option<V>>| {
            let kept = value.clone();
            let done = done.adapt(move |output: O| output.is_truthy().then_some(kept));
            transform(ctx, value, key, done);
        };

        // Pick results are keyed no matter the source shape, so an empty
        // source yields an empty `Keyed` in every variant.
        self.start(
            view.into(),
            limit.into(),
            Arc::new(select),
            Box::new(move |outcome: Outcome<Collected<Option<V>>>| {
                on_done(project(outcome))
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::RunError;
    use crate::executor::tests::{DELAY, Order, after};
    use quickcheck::quickcheck;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    fn keyed<K: Into<Key>, V>(entries: Vec<(K, V)>) -> Keyed<V> {
        entries.into_iter().collect()
    }

    /// Keeps odd values after `value * DELAY` milliseconds, recording the
    /// completion order.
    fn odd_after(order: &Order<u64>) -> impl Fn(&(), u64, &Key, Completion<u64>) + Send + Sync + 'static {
        let order = order.clone();
        move |_, n, _, done| {
            let order = order.clone();
            after(n * DELAY, move || {
                order.lock().unwrap().push(n);
                done.ok(n % 2);
            });
        }
    }

    fn odd_after_with_key(
        order: &Order<(u64, Key)>,
    ) -> impl Fn(&(), u64, &Key, Completion<u64>) + Send + Sync + 'static {
        let order = order.clone();
        move |_, n, key, done| {
            let order = order.clone();
            let key = key.clone();
            after(n * DELAY, move || {
                order.lock().unwrap().push((n, key));
                done.ok(n % 2);
            });
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(1u8.is_truthy());
        assert!(!0i64.is_truthy());
        assert!(!f64::NAN.is_truthy());
        assert!(0.5f32.is_truthy());
        assert!(!"".is_truthy());
        assert!(String::from("x").is_truthy());
        assert!(!Some(false).is_truthy());
        assert!(Some(3).is_truthy());
        assert!(!None::<i32>.is_truthy());
    }

    #[test]
    fn test_pick_sequence() {
        let order = Order::default();
        let res = Executor::new()
            .pick(OrderedView::sequence([1u64, 3, 2, 4]), odd_after(&order))
            .wait()
            .unwrap();

        assert_eq!(res, keyed(vec![(0usize, 1), (1, 3)]));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_pick_record_with_key() {
        let order = Order::default();
        let res = Executor::new()
            .pick(
                OrderedView::record([("a", 4u64), ("b", 3), ("c", 2)]),
                odd_after_with_key(&order),
            )
            .wait()
            .unwrap();

        assert_eq!(res, keyed(vec![("b", 3)]));
        assert_eq!(
            *order.lock().unwrap(),
            vec![(2, Key::from("c")), (3, Key::from("b")), (4, Key::from("a"))]
        );
    }

    #[test]
    fn test_pick_set_keys_by_position() {
        let order = Order::default();
        let res = Executor::new()
            .pick(
                OrderedView::set([4u64, 3, 2]),
                odd_after_with_key(&order),
            )
            .wait()
            .unwrap();

        assert_eq!(res, keyed(vec![(1usize, 3)]));
        assert_eq!(
            *order.lock().unwrap(),
            vec![(2, Key::from(2usize)), (3, Key::from(1usize)), (4, Key::from(0usize))]
        );
    }

    #[test]
    fn test_pick_pairs_keeps_pairs() {
        let res = Executor::new()
            .pick(
                OrderedView::pairs([("a", 4u64), ("b", 3), ("c", 2)]),
                |_, (_, n), _, done: Completion<u64>| done.ok(n % 2),
            )
            .wait()
            .unwrap();

        assert_eq!(res, keyed(vec![(1usize, ("b", 3))]));
    }

    struct Rounding;

    #[test]
    fn test_pick_context() {
        let res = Executor::with_context(Rounding)
            .pick(
                OrderedView::record([("a", 1.1f64), ("b", 3.5), ("c", 2.6)]),
                |_: &Rounding, n: f64, _, done| done.ok(n.round() as i64 % 2),
            )
            .wait()
            .unwrap();

        assert_eq!(res, keyed(vec![("a", 1.1), ("c", 2.6)]));
    }

    #[test]
    fn test_pick_error_keeps_earlier_picks() {
        let order = Order::default();
        let seen = order.clone();

        let err = Executor::new()
            .pick(
                OrderedView::sequence([1u64, 3, 2, 4]),
                move |_, n, _, done: Completion<u64>| {
                    let seen = seen.clone();
                    after(n * DELAY, move || {
                        seen.lock().unwrap().push(n);
                        if n == 3 {
                            done.fail(anyhow::anyhow!("three"));
                        } else {
                            done.ok(n % 2);
                        }
                    });
                },
            )
            .wait()
            .unwrap_err();

        assert_eq!(err.partial(), Some(&keyed(vec![(0usize, 1)])));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_pick_series_error() {
        let order = Order::default();
        let seen = order.clone();

        let err = Executor::new()
            .pick_series(
                OrderedView::record([("a", 1u64), ("b", 3), ("c", 2), ("d", 4)]),
                move |_, n, _, done: Completion<u64>| {
                    let seen = seen.clone();
                    after(n * 5, move || {
                        seen.lock().unwrap().push(n);
                        if n == 3 {
                            done.fail(anyhow::anyhow!("three"));
                        } else {
                            done.ok(n % 2);
                        }
                    });
                },
            )
            .wait()
            .unwrap_err();

        assert_eq!(err.partial(), Some(&keyed(vec![("a", 1)])));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_pick_series_runs_in_source_order() {
        let order = Order::default();
        let res = Executor::new()
            .pick_series(
                OrderedView::record([("a", 4u64), ("b", 3), ("c", 2)]),
                odd_after_with_key(&order),
            )
            .wait()
            .unwrap();

        assert_eq!(res, keyed(vec![("b", 3)]));
        assert_eq!(
            *order.lock().unwrap(),
            vec![(4, Key::from("a")), (3, Key::from("b")), (2, Key::from("c"))]
        );
    }

    #[test]
    fn test_pick_limit_order() {
        let order = Order::default();
        let res = Executor::new()
            .pick_limit(
                OrderedView::sequence([1u64, 5, 3, 2, 4]),
                Limit::Bounded(2),
                odd_after(&order),
            )
            .wait()
            .unwrap();

        assert_eq!(res, keyed(vec![(0usize, 1), (1, 5), (2, 3)]));
        assert_eq!(*order.lock().unwrap(), vec![1, 3, 5, 2, 4]);
    }

    #[test]
    fn test_pick_limit_infinity_matches_pick() {
        let order = Order::default();
        let res = Executor::new()
            .pick_limit(
                OrderedView::sequence([1u64, 3, 4, 2, 3, 1, 3]),
                f64::INFINITY,
                odd_after(&order),
            )
            .wait()
            .unwrap();

        assert_eq!(
            res,
            keyed(vec![(0usize, 1), (1, 3), (4, 3), (5, 1), (6, 3)])
        );
        assert_eq!(*order.lock().unwrap(), vec![1, 1, 2, 3, 3, 3, 4]);
    }

    #[test]
    fn test_pick_limit_error() {
        let order = Order::default();
        let seen = order.clone();

        let err = Executor::new()
            .pick_limit(
                OrderedView::record([("a", 2u64), ("b", 1), ("c", 3)]),
                Limit::Bounded(4),
                move |_, n, _, done: Completion<u64>| {
                    let seen = seen.clone();
                    after(n * DELAY, move || {
                        seen.lock().unwrap().push(n);
                        if n == 2 {
                            done.fail(anyhow::anyhow!("two"));
                        } else {
                            done.ok(n);
                        }
                    });
                },
            )
            .wait()
            .unwrap_err();

        assert_eq!(err.partial(), Some(&keyed(vec![("b", 1)])));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_pick_limit_zero_or_unspecified() {
        let calls = Arc::new(AtomicUsize::new(0));

        for limit in [Limit::from(0usize), Limit::from(None)] {
            let counter = calls.clone();
            let res = Executor::new()
                .pick_limit(
                    OrderedView::sequence([1, 3, 2]),
                    limit,
                    move |_, n: i32, _, done| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        done.ok(n);
                    },
                )
                .wait()
                .unwrap();
            assert!(res.is_empty());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_and_absent_inputs_for_every_variant() {
        let views = || {
            vec![
                OrderedView::sequence(Vec::<i32>::new()),
                OrderedView::record(Vec::<(&str, i32)>::new()),
                OrderedView::absent(),
                None::<Vec<i32>>.into(),
            ]
        };

        let transform = |_: &(), n: i32, _: &Key, done: Completion<i32>| done.ok(n);

        for view in views() {
            let res = Executor::new().pick(view, transform).wait().unwrap();
            assert_eq!(res, Keyed::new());
        }
        for view in views() {
            let res = Executor::new().pick_series(view, transform).wait().unwrap();
            assert_eq!(res, Keyed::new());
        }
        for view in views() {
            let res = Executor::new()
                .pick_limit(view, Limit::Bounded(3), transform)
                .wait()
                .unwrap();
            assert_eq!(res, Keyed::new());
        }
    }

    #[test]
    fn test_pick_double_completion() {
        let (fault_tx, fault_rx) = channel();
        let fault_tx = Mutex::new(fault_tx);
        let config = Config::new().on_fault(move |fault| {
            fault_tx.lock().unwrap().send(fault).unwrap();
        });

        let res = Executor::new()
            .with_config(config)
            .pick_limit(
                OrderedView::record([("a", 4), ("b", 3), ("c", 2)]),
                Limit::Bounded(4),
                |_, _: i32, _, done: Completion<bool>| {
                    let again = done.clone();
                    after(1, move || done.ok(false));
                    after(2, move || again.ok(false));
                },
            )
            .wait()
            .unwrap();

        assert!(res.is_empty());

        let faults: Vec<_> = (0..3)
            .map(|_| fault_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert!(faults.iter().all(|fault| fault.calls == 2));
        assert!(fault_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_pick_with_is_asynchronous() {
        let (tx, rx) = channel();
        let caller = thread::current().id();

        Executor::new().pick_with(
            OrderedView::record([("a", 1), ("b", 3), ("c", 2)]),
            Limit::Bounded(2),
            |_, n: i32, _, done| done.ok(n % 2),
            move |outcome| {
                tx.send((thread::current().id(), outcome)).unwrap();
            },
        );

        let (thread, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(thread, caller);
        assert_eq!(outcome.unwrap(), keyed(vec![("a", 1), ("b", 3)]));
    }

    #[test]
    fn test_panicking_pick_transform_fails_the_run() {
        let panicky = |_: &(), n: i32, _: &Key, done: Completion<bool>| {
            if n == 2 {
                panic!("bad input");
            }
            done.ok(true);
        };

        let outcomes = [
            Executor::new().pick_series(OrderedView::sequence([1, 2]), panicky).wait(),
            Executor::new()
                .pick_limit(OrderedView::sequence([1, 2]), Limit::SERIES, panicky)
                .wait(),
        ];

        for outcome in outcomes {
            let err = outcome.unwrap_err();
            assert_eq!(
                err.error().unwrap().to_string(),
                "entry 1 panicked: bad input"
            );
            assert_eq!(err.partial(), Some(&keyed(vec![(0usize, 1)])));
        }

        let err = Executor::new()
            .pick(OrderedView::record([("a", 2)]), panicky)
            .wait()
            .unwrap_err();
        assert_eq!(err.error().unwrap().to_string(), "entry a panicked: bad input");
        assert_eq!(err.partial(), Some(&Keyed::new()));
    }

    #[test]
    fn test_pick_abandoned() {
        let outcome = Executor::new()
            .pick(
                OrderedView::sequence([1]),
                |_, _: i32, _, done: Completion<bool>| drop(done),
            )
            .wait();
        assert!(matches!(outcome, Err(RunError::Abandoned { .. })));
    }

    quickcheck! {
        fn prop_pick_matches_filter(items: Vec<u8>, limit: u8) -> bool {
            let limit = Limit::Bounded(usize::from(limit % 4) + 1);
            let expected: Keyed<u8> = items
                .iter()
                .enumerate()
                .filter(|(_, n)| *n % 3 == 0)
                .map(|(i, n)| (i, *n))
                .collect();

            let res = Executor::new()
                .pick_limit(
                    OrderedView::sequence(items),
                    limit,
                    |_, n: u8, _, done| done.ok(n % 3 == 0),
                )
                .wait()
                .unwrap();

            res == expected
        }
    }
}
