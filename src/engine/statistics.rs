// ============================================================================
// Session factory statistics
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident => $increment:ident),* $(,)?) => {
        /// Atomic counters shared by every session of a factory.
        #[derive(Debug, Default)]
        pub struct Statistics {
            $($name: AtomicU64,)*
        }

        impl Statistics {
            pub fn new() -> Self {
                Self::default()
            }

            $(
                $(#[$doc])*
                pub fn $name(&self) -> u64 {
                    self.$name.load(Ordering::Relaxed)
                }

                pub(crate) fn $increment(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn clear(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    session_open_count => session_opened,
    session_close_count => session_closed,
    /// Statements sent to the database, queries and writes alike
    prepare_statement_count => statement_prepared,
    /// Entities hydrated from a result set
    entity_load_count => entity_loaded,
    /// Entities loaded by a secondary select (proxies, immediate select fetches)
    entity_fetch_count => entity_fetched,
    entity_insert_count => entity_inserted,
    entity_update_count => entity_updated,
    entity_delete_count => entity_deleted,
    collection_load_count => collection_loaded,
    collection_fetch_count => collection_fetched,
    collection_update_count => collection_updated,
    collection_remove_count => collection_removed,
    collection_recreate_count => collection_recreated,
    second_level_cache_hit_count => cache_hit,
    second_level_cache_miss_count => cache_miss,
    second_level_cache_put_count => cache_put,
    flush_count => flushed,
    transaction_count => transaction_completed,
    successful_transaction_count => transaction_succeeded,
    optimistic_failure_count => optimistic_failure,
    query_execution_count => query_executed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Statistics::new();
        stats.entity_loaded();
        stats.entity_loaded();
        stats.cache_hit();
        assert_eq!(stats.entity_load_count(), 2);
        assert_eq!(stats.second_level_cache_hit_count(), 1);
        stats.clear();
        assert_eq!(stats.entity_load_count(), 0);
    }
}
