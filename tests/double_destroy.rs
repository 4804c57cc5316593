use ptl::PoolBuilder;

#[test]
fn destroy_twice_is_a_no_op() {
    let pool = PoolBuilder::new().num_threads(2).build().unwrap();
    assert_eq!(pool.destroy().unwrap(), 0);
    assert_eq!(pool.destroy().unwrap(), 0);
    assert_eq!(pool.pool_size(), 0);
}
