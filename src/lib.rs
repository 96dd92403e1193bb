pub mod core;
pub mod codec;
pub mod storage;
pub mod index;
pub mod backend;
pub mod import;

/*
┌────────────────────────────────────────────────────────────────────────────────────────────┐
│                              DIRSTORE STRUCT ARCHITECTURE                                   │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────────── BACKEND LAYER ────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                               struct Backend                                        │    │
│  │  ┌──────────────────────────────────────────────────────────────────────────────┐ │    │
│  │  │ config: RwLock<BackendConfig>     // Swapped by apply_config_change          │ │    │
│  │  │ layout: Option<StorageLayout>     // db/, tmp/, backup/                      │ │    │
│  │  │ root: RootContainer               // Storage + one container per base DN     │ │    │
│  │  │ cache: Option<Arc<LruEntryCache>> // Decoded entries by ID                   │ │    │
│  │  └──────────────────────────────────────────────────────────────────────────────┘ │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│                                                                                              │
│  ┌──────────────────────────┐  ┌──────────────────────────────┐  ┌──────────────────────┐  │
│  │ struct RootContainer     │  │ struct EntryContainer        │  │ struct Inspector     │  │
│  │ • storage: Arc<Storage>  │  │ • dn2id / id2childrencount   │  │ • list_trees()       │  │
│  │ • ids: EntryIdAllocator  │  │ • dn2uri / state             │  │ • tree_stats()       │  │
│  │ • containers: BTreeMap   │  │ • indexes: RwLock<           │  │ • entry_limit_stats()│  │
│  │ • swap_container()       │  │     ContainerIndexes>        │  │ • dump()             │  │
│  └──────────────────────────┘  │ • add/delete/replace/rename  │  └──────────────────────┘  │
│                                │ • search()                   │                             │
│                                └──────────────────────────────┘                             │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────────── INDEX LAYER ─────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────┐  ┌──────────────────────────┐  ┌──────────────────────────┐    │
│  │ struct DN2ID           │  │ struct ID2Entry          │  │ enum EntryIDSet          │    │
│  │ • DN key -> EntryID    │  │ • EntryID -> EntryCodec  │  │ • Defined(Roaring)       │    │
│  └────────────────────────┘  └──────────────────────────┘  │ • Undefined { size }     │    │
│  ┌────────────────────────┐  ┌──────────────────────────┐  └──────────────────────────┘    │
│  │ struct AttributeIndex  │  │ struct VLVIndex          │  ┌──────────────────────────┐    │
│  │ • MatchingRuleIndex[]  │  │ • sort key ++ ID -> ID   │  │ struct IndexBuffer       │    │
│  │ • Indexer per type     │  │ • select_window()        │  │ • per-tree deltas        │    │
│  └────────────────────────┘  └──────────────────────────┘  └──────────────────────────┘    │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────────── IMPORT LAYER ────────────────────────────────────────┐
│                                                                                              │
│  Phase one: EntryReader ──> DN validation ──> workers ──> ExternalSortChunk per tree        │
│                                                    │            (SortBuffer from BufferPool) │
│                                                    └──> id2entry via Importer               │
│                                                                                              │
│  Phase two: chunk.flip() ──> CompositeCursor ──> CollectorCursor ──> Importer.put()         │
│             dn2id first: OrderedDnValidator + ChildrenCounter ──> id2childrencount           │
│             other trees on a rayon pool, largest first, gated by Semaphore                  │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────────── STORAGE LAYER ───────────────────────────────────────┐
│                                                                                              │
│  trait Storage ──begin_read──> ReadableTransaction ──> Cursor                               │
│        │        ──begin_write─> WriteableTransaction (all-or-nothing commit)                 │
│        │        ──start_import─> Importer (ordered bulk puts)                                │
│        └──impl──> BTreeStorage ──persists──> Snapshot (bincode + crc32) under FileLock      │
└──────────────────────────────────────────────────────────────────────────────────────────────┘
*/
