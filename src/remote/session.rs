use crate::error::Result;
use crate::remote::RemoteRepo;

/// Opens `remote`, runs `f` and closes the session again on every exit path.
///
/// If `open` fails nothing was acquired and its error is returned. A failing
/// `close` is reported only when `f` succeeded; otherwise it is logged and
/// the error from `f` wins.
pub fn with_session<R, T, F>(remote: &mut R, f: F) -> Result<T>
where
    R: RemoteRepo + ?Sized,
    F: FnOnce(&mut R) -> Result<T>,
{
    remote.open()?;
    let result = f(remote);
    let closed = remote.close();
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_error)) => {
            tracing::warn!(
                remote = remote.name(),
                error = %close_error,
                "closing remote session failed after an earlier error"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::error::Error;
    use crate::refs::Ref;
    use crate::remote::PushStatus;
    use crate::remote::RefUpdate;
    use crate::remote::SessionState;
    use crate::remote::Want;
    use crate::store::ObjectStore;

    #[derive(Default)]
    struct Scripted {
        state: Option<SessionState>,
        opens: usize,
        closes: usize,
        fail_open: bool,
        fail_close: bool,
    }

    impl RemoteRepo for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn state(&self) -> SessionState {
            self.state.unwrap_or(SessionState::Closed)
        }

        fn open(&mut self) -> Result<()> {
            self.opens += 1;
            if self.fail_open {
                return Err(Error::PreconditionFailed("unreachable".to_owned()));
            }
            self.state = Some(SessionState::Open);
            Ok(())
        }

        fn list_refs(&mut self, _heads: bool, _tags: bool) -> Result<BTreeSet<Ref>> {
            Ok(BTreeSet::new())
        }

        fn fetch(&mut self, _local: &dyn ObjectStore, _want: &[Want]) -> Result<BTreeSet<Ref>> {
            Ok(BTreeSet::new())
        }

        fn push(
            &mut self,
            _local: &dyn ObjectStore,
            _updates: &[RefUpdate],
        ) -> Result<Vec<(String, PushStatus)>> {
            Ok(Vec::new())
        }

        fn close(&mut self) -> Result<()> {
            self.closes += 1;
            self.state = Some(SessionState::Closed);
            if self.fail_close {
                return Err(Error::Inconsistent("close".to_owned()));
            }
            Ok(())
        }
    }

    #[test]
    fn closes_after_success() {
        let mut remote = Scripted::default();
        let value = with_session(&mut remote, |r| {
            assert_eq!(r.state(), SessionState::Open);
            Ok(7)
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!((remote.opens, remote.closes), (1, 1));
        assert_eq!(remote.state(), SessionState::Closed);
    }

    #[test]
    fn closes_after_failure_and_keeps_the_first_error() {
        let mut remote = Scripted {
            fail_close: true,
            ..Default::default()
        };
        let err = with_session(&mut remote, |_| -> Result<()> {
            Err(Error::RefNotFound("refs/heads/main".to_owned()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::RefNotFound(_)));
        assert_eq!(remote.closes, 1);
    }

    #[test]
    fn close_failure_surfaces_when_work_succeeded() {
        let mut remote = Scripted {
            fail_close: true,
            ..Default::default()
        };
        let err = with_session(&mut remote, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Inconsistent(_)));
    }

    #[test]
    fn failed_open_is_not_closed() {
        let mut remote = Scripted {
            fail_open: true,
            ..Default::default()
        };
        let err = with_session(&mut remote, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
        assert_eq!((remote.opens, remote.closes), (1, 0));
    }
}
