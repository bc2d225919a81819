//! Behaviour every channel implementation must share.

use std::num::NonZeroU32;

use async_trait::async_trait;
use bronze_types::{PartitionId, Position};
use bytes::Bytes;
use futures::StreamExt;

use crate::{ChannelReading, ChannelWriting};

#[async_trait]
pub(crate) trait TestAdapter: Send + Sync {
    type Context: TestContext;

    async fn new_context(&self, n_partitions: NonZeroU32) -> Self::Context;
}

#[async_trait]
pub(crate) trait TestContext: Send + Sync {
    type Writing: ChannelWriting;
    type Reading: ChannelReading;

    fn writing(&self) -> Self::Writing;

    async fn reading(&self) -> Self::Reading;
}

pub(crate) async fn perform_generic_tests<T>(adapter: T)
where
    T: TestAdapter,
{
    test_single_stream_io(&adapter).await;
    test_multi_partition_io(&adapter).await;
    test_stream_from_position(&adapter).await;
    test_high_watermark(&adapter).await;
}

fn payload(n: u32) -> Bytes {
    Bytes::from(format!(r#"{{"n":{n}}}"#))
}

async fn test_single_stream_io<T>(adapter: &T)
where
    T: TestAdapter,
{
    let context = adapter.new_context(NonZeroU32::new(1).unwrap()).await;
    let writer = context.writing();
    let reader = context.reading().await;

    let partitions = ChannelReading::partitions(&reader);
    assert_eq!(partitions, vec![PartitionId::new(0)]);
    let p = partitions[0];

    let mut stream = reader.stream(p, Position::ZERO).await.unwrap();

    let waker = futures::task::noop_waker();
    let mut cx = futures::task::Context::from_waker(&waker);

    // empty stream is pending
    assert!(stream.poll_next_unpin(&mut cx).is_pending());

    let meta = writer.append(p, payload(1)).await.unwrap();
    assert_eq!(meta.partition, p);
    assert_eq!(meta.position, Position::new(0));

    let record = stream.next().await.unwrap().unwrap();
    assert_eq!(record.payload, payload(1));
    assert_eq!(record.meta(), meta);

    writer.append(p, payload(2)).await.unwrap();
    writer.append(p, payload(3)).await.unwrap();
    let record = stream.next().await.unwrap().unwrap();
    assert_eq!((record.position, record.payload), (Position::new(1), payload(2)));
    let record = stream.next().await.unwrap().unwrap();
    assert_eq!((record.position, record.payload), (Position::new(2), payload(3)));
}

async fn test_multi_partition_io<T>(adapter: &T)
where
    T: TestAdapter,
{
    let context = adapter.new_context(NonZeroU32::new(2).unwrap()).await;
    let writer = context.writing();
    let reader = context.reading().await;

    let partitions = ChannelWriting::partitions(&writer);
    assert_eq!(partitions.len(), 2);
    let (p0, p1) = (partitions[0], partitions[1]);

    let mut stream_0 = reader.stream(p0, Position::ZERO).await.unwrap();
    let mut stream_1 = reader.stream(p1, Position::ZERO).await.unwrap();

    writer.append(p0, payload(1)).await.unwrap();
    writer.append(p1, payload(2)).await.unwrap();
    writer.append(p0, payload(3)).await.unwrap();

    // each partition keeps its own positions
    let r = stream_1.next().await.unwrap().unwrap();
    assert_eq!((r.partition, r.position, r.payload), (p1, Position::new(0), payload(2)));
    let r = stream_0.next().await.unwrap().unwrap();
    assert_eq!((r.partition, r.position, r.payload), (p0, Position::new(0), payload(1)));
    let r = stream_0.next().await.unwrap().unwrap();
    assert_eq!((r.partition, r.position, r.payload), (p0, Position::new(1), payload(3)));
}

async fn test_stream_from_position<T>(adapter: &T)
where
    T: TestAdapter,
{
    let context = adapter.new_context(NonZeroU32::new(1).unwrap()).await;
    let writer = context.writing();
    let reader = context.reading().await;
    let p = PartitionId::new(0);

    for n in 0..5 {
        writer.append(p, payload(n)).await.unwrap();
    }

    let mut stream = reader.stream(p, Position::new(3)).await.unwrap();
    let r = stream.next().await.unwrap().unwrap();
    assert_eq!((r.position, r.payload), (Position::new(3), payload(3)));
    let r = stream.next().await.unwrap().unwrap();
    assert_eq!((r.position, r.payload), (Position::new(4), payload(4)));

    // a second reader of the same partition sees everything again
    let mut again = reader.stream(p, Position::ZERO).await.unwrap();
    assert_eq!(again.next().await.unwrap().unwrap().payload, payload(0));
}

async fn test_high_watermark<T>(adapter: &T)
where
    T: TestAdapter,
{
    let context = adapter.new_context(NonZeroU32::new(1).unwrap()).await;
    let writer = context.writing();
    let reader = context.reading().await;
    let p = PartitionId::new(0);

    assert_eq!(reader.high_watermark(p).await.unwrap(), Position::ZERO);
    writer.append(p, payload(1)).await.unwrap();
    writer.append(p, payload(2)).await.unwrap();
    assert_eq!(reader.high_watermark(p).await.unwrap(), Position::new(2));
}
